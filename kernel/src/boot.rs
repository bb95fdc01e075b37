// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel-side bootloader handoff glue (spec §6 "Bootloader handoff").
//!
//! The wire-level validation rules (magic, version range, checksums, record
//! structure) are pure and live in `orion_abi::boot`, shared with anything
//! that needs to build or inspect a handoff blob without linking the
//! kernel. This module adds the one policy decision that belongs to the
//! kernel: what happens when validation fails.

use orion_abi::boot::{self, HandoffHeader};

use crate::kpanic;

/// Validates `blob` and enters the panic path on any mismatch, per spec §7:
/// "bootloader-handoff validation failures are fatal -- they enter the
/// panic path."
pub fn validate_or_panic(blob: &[u8]) -> HandoffHeader {
    match boot::validate(blob) {
        Ok(header) => header,
        Err(e) => kpanic!("bootloader handoff validation failed: {:?}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic]
    fn malformed_blob_enters_panic_path() {
        crate::hal::fake::install_once();
        crate::klog::init();
        crate::klog::reset_emergency_for_test();
        validate_or_panic(&[0u8; 4]);
    }
}
