// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

pub mod gzip_file;
pub mod info;
pub mod lz4_file;
pub mod manager;
pub mod upgrade_file;
pub mod zip_file;
