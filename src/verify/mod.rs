// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

pub mod asn1;
pub mod hash_data;
pub mod pkcs7;
pub mod verify_util;
pub mod zip_parse;
