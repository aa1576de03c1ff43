#![allow(dead_code)]

pub mod fake_guest;
pub mod vm_preflight;
