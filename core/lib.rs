// This file is part of linewatch, a video line-crossing counting service.
// Copyright (C) 2020 The linewatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The processing plane: detection -> tracking -> line-crossing ->
//! annotation -> broadcast -> persistence, plus the job manager that
//! mediates control commands against the per-job workers that drive it.

pub mod annotate;
pub mod broadcaster;
pub mod config;
pub mod crossing;
pub mod detect;
pub mod encode;
pub mod frame;
pub mod geometry;
pub mod job;
pub mod manager;
pub mod source;
pub mod store;
pub mod track;
pub mod worker;
