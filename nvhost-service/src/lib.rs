// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Character-device style front end for a [`nvhost_core::Host1xDevice`].

pub mod channel;
pub mod ctrl;
pub mod dispatcher;
pub mod node;
pub mod nvmap;

pub use dispatcher::{NvhostNodes, CTRL_PATH, NVMAP_PATH};
pub use node::{IoctlError, NvhostNode};
