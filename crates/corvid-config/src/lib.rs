// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod loader;
mod manager;
mod schema;
mod watch;

pub use loader::{load, load_file};
pub use manager::{diff_configs, Changes, ConfigManager};
pub use schema::*;
pub use watch::HotReload;
