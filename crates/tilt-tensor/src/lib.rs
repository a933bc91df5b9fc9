// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of MaxTilt — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Pure Rust numeric primitives backing the MaxTilt feature engine.
//!
//! Everything here is written in safe Rust with only lightweight external
//! dependencies so the adaptation engine can run anywhere a plain CPU build
//! runs. The [`Tensor`] type is a dense row-major matrix sized for sample
//! batches; [`RunningMean`] provides the O(1)-memory streaming averages the
//! engine leans on for diagnostics.

pub mod running;
pub mod tensor;

pub use running::RunningMean;
pub use tensor::{l2_norm, PureResult, Tensor, TensorError};
