//! Synthetic disk images shared by the integration tests
#![allow(dead_code)]

pub mod fat;
pub mod ntfs;

use lazarus_core::{Device, ReadPolicy, SharedStream};
use std::sync::Arc;

pub fn put_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub fn put_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn put_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

pub fn utf16(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

pub fn align8(value: usize) -> usize {
    (value + 7) & !7
}

/// Wrap an image in an in-memory device
pub fn device(image: Vec<u8>, policy: ReadPolicy) -> SharedStream {
    Arc::new(Device::from_bytes("test", image, policy))
}
