// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::str::FromStr;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::SchedulerError;

/// One step of a multi-tool batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolStep {
    pub tool_name: String,
    #[serde(default = "empty_args")]
    pub tool_args: serde_json::Value,
}

fn empty_args() -> serde_json::Value {
    serde_json::json!({})
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Serial,
    Parallel,
}

/// How a task executes when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMode {
    Single,
    Multi,
    SelfCall,
}

fn default_target_type() -> String {
    "group".into()
}

/// One scheduled task, persisted as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub task_id: String,
    /// Standard five-field cron expression (`min hour dom month dow`).
    pub cron: String,
    #[serde(default)]
    pub task_name: String,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default = "empty_args")]
    pub tool_args: serde_json::Value,
    #[serde(default)]
    pub tools: Option<Vec<ToolStep>>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// Self-call mode: the prompt the bot receives as if from a user.
    #[serde(default)]
    pub self_instruction: Option<String>,
    #[serde(default)]
    pub target_id: Option<i64>,
    #[serde(default = "default_target_type")]
    pub target_type: String,
    #[serde(default)]
    pub max_executions: Option<u32>,
    #[serde(default)]
    pub current_executions: u32,
}

impl ScheduledTask {
    /// Generate a task id, readable when a name is given.
    pub fn generate_id(task_name: Option<&str>) -> String {
        let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];
        match task_name {
            Some(name) if !name.trim().is_empty() => {
                let slug = name.trim().to_lowercase().replace(' ', "_");
                format!("task_{slug}_{}", &suffix[..4])
            }
            _ => format!("task_{suffix}"),
        }
    }

    /// The execution mode implied by which fields are set.
    pub fn mode(&self) -> TaskMode {
        if self.self_instruction.is_some() {
            TaskMode::SelfCall
        } else if self.tools.as_ref().map(|t| !t.is_empty()).unwrap_or(false) {
            TaskMode::Multi
        } else {
            TaskMode::Single
        }
    }

    /// Exactly one of `tool_name` / `tools` / `self_instruction` must be set,
    /// and the cron expression must parse.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        parse_cron(&self.cron)?;
        let has_single = self.tool_name.as_ref().map(|t| !t.is_empty()).unwrap_or(false);
        let has_multi = self.tools.as_ref().map(|t| !t.is_empty()).unwrap_or(false);
        let has_self = self
            .self_instruction
            .as_ref()
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);
        let mode_count = [has_single, has_multi, has_self].iter().filter(|b| **b).count();
        if mode_count == 0 {
            return Err(SchedulerError::Invalid(
                "one of tool_name, tools, self_instruction is required".into(),
            ));
        }
        if mode_count > 1 {
            return Err(SchedulerError::Invalid(
                "tool_name, tools and self_instruction are mutually exclusive".into(),
            ));
        }
        if let Some(max) = self.max_executions {
            if max == 0 {
                return Err(SchedulerError::Invalid("max_executions must be > 0".into()));
            }
        }
        Ok(())
    }

    /// The next local fire time strictly after `after`.
    pub fn next_fire(&self, after: DateTime<Local>) -> Option<DateTime<Local>> {
        let schedule = parse_cron(&self.cron).ok()?;
        schedule.after(&after).next()
    }
}

/// Parse standard five-field cron.  The `cron` crate wants a seconds field;
/// a five-field expression gets `0 ` prepended so `* * * * *` means "every
/// minute", not "every second".
pub fn parse_cron(expr: &str) -> Result<cron::Schedule, SchedulerError> {
    let trimmed = expr.trim();
    let fields = trimmed.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| SchedulerError::Invalid(format!("bad cron expression {expr:?}: {e}")))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn single_task() -> ScheduledTask {
        ScheduledTask {
            task_id: "t1".into(),
            cron: "* * * * *".into(),
            task_name: String::new(),
            tool_name: Some("get_time".into()),
            tool_args: serde_json::json!({}),
            tools: None,
            execution_mode: ExecutionMode::Serial,
            self_instruction: None,
            target_id: Some(100),
            target_type: "group".into(),
            max_executions: None,
            current_executions: 0,
        }
    }

    #[test]
    fn five_field_cron_parses() {
        assert!(parse_cron("* * * * *").is_ok());
        assert!(parse_cron("30 8 * * 1-5").is_ok());
        assert!(parse_cron("not a cron").is_err());
    }

    #[test]
    fn every_minute_fires_on_minute_boundary() {
        let task = single_task();
        let now = Local::now();
        let next = task.next_fire(now).unwrap();
        assert!(next > now);
        assert_eq!(next.timestamp() % 60, 0, "fires at second zero");
        assert!(next.timestamp() - now.timestamp() <= 60);
    }

    #[test]
    fn validate_requires_exactly_one_mode() {
        let ok = single_task();
        assert!(ok.validate().is_ok());

        let mut none = single_task();
        none.tool_name = None;
        assert!(none.validate().is_err());

        let mut both = single_task();
        both.self_instruction = Some("do something".into());
        assert!(both.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_max_executions() {
        let mut task = single_task();
        task.max_executions = Some(0);
        assert!(task.validate().is_err());
    }

    #[test]
    fn mode_detection() {
        assert_eq!(single_task().mode(), TaskMode::Single);

        let mut multi = single_task();
        multi.tool_name = None;
        multi.tools = Some(vec![ToolStep {
            tool_name: "a".into(),
            tool_args: serde_json::json!({}),
        }]);
        assert_eq!(multi.mode(), TaskMode::Multi);

        let mut self_call = single_task();
        self_call.tool_name = None;
        self_call.self_instruction = Some("列出待办前三项".into());
        assert_eq!(self_call.mode(), TaskMode::SelfCall);
    }

    #[test]
    fn generated_ids_embed_name_slug() {
        let id = ScheduledTask::generate_id(Some("Morning Report"));
        assert!(id.starts_with("task_morning_report_"));
        let anon = ScheduledTask::generate_id(None);
        assert!(anon.starts_with("task_"));
        assert_ne!(ScheduledTask::generate_id(None), anon);
    }

    #[test]
    fn task_round_trips_through_json() {
        let task = single_task();
        let json = serde_json::to_string(&task).unwrap();
        let back: ScheduledTask = serde_json::from_str(&json).unwrap();
        assert_eq!(back, task);
    }
}
