// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

pub mod block_set;
pub mod image_patch;
pub mod store;
pub mod transfer;
pub mod writer;
