// SPDX-License-Identifier: GPL-3.0-only

//! Backend abstraction layer
//!
//! Every way of reaching a camera lives under [`camera`]: the driver trait,
//! one driver per device family, the registry that merges their results and
//! the helpers they share (command runner, conflict resolver, hotplug).

pub mod camera;
