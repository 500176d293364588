// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

pub mod applypatch;
pub mod codec;
pub mod constants;
pub mod errors;
pub mod package;
pub mod ptable;
pub mod ringbuf;
pub mod script;
pub mod stream;
pub mod updater;
pub mod utils;
pub mod verify;
