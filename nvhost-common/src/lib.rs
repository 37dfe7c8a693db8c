// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod error;
pub mod settings;
pub mod types;

pub use error::{Host1xError, Host1xResult};
pub use types::*;
