// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Request pacing, retry with backoff, and per-target circuit breaking.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;
