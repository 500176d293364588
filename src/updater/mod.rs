// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

pub mod env;
pub mod fault_retry;
pub mod misc;
pub mod partition_record;
