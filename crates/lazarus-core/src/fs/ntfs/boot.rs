/// NTFS boot sector
use anyhow::Result;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

/// OEM id carried at offset 3 of every NTFS boot sector
pub const NTFS_OEM_ID: &[u8; 8] = b"NTFS    ";

/// Quick check used by filesystem detection
pub fn is_ntfs_boot_sector(sector: &[u8]) -> bool {
    sector.len() >= 512 && &sector[3..11] == NTFS_OEM_ID
}

#[derive(Debug, Clone)]
pub struct NtfsBootSector {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u32,
    pub total_sectors: u64,
    pub mft_lcn: u64,
    pub mft_mirror_lcn: u64,
    pub mft_record_size: u32,
    pub index_buffer_size: u32,
    pub serial_number: u64,
}

impl NtfsBootSector {
    /// Parse and validate the first sector of an NTFS volume
    pub fn parse(data: &[u8]) -> Result<Self> {
        if !is_ntfs_boot_sector(data) {
            anyhow::bail!("Not an NTFS boot sector");
        }

        let mut cursor = Cursor::new(data);
        cursor.set_position(0x0B);
        let bytes_per_sector = cursor.read_u16::<LittleEndian>()?;
        let raw_sectors_per_cluster = cursor.read_u8()?;

        cursor.set_position(0x28);
        let total_sectors = cursor.read_u64::<LittleEndian>()?;
        let mft_lcn = cursor.read_u64::<LittleEndian>()?;
        let mft_mirror_lcn = cursor.read_u64::<LittleEndian>()?;
        let raw_record_size = cursor.read_i8()?;
        let mut padding = [0u8; 3];
        cursor.read_exact(&mut padding)?;
        let raw_index_size = cursor.read_i8()?;
        cursor.read_exact(&mut padding)?;
        let serial_number = cursor.read_u64::<LittleEndian>()?;

        if !bytes_per_sector.is_power_of_two() || !(256..=4096).contains(&bytes_per_sector) {
            anyhow::bail!("Invalid NTFS bytes per sector: {}", bytes_per_sector);
        }

        // Values above 0x80 encode 2^(256 - n) sectors on large-cluster volumes
        let sectors_per_cluster = match raw_sectors_per_cluster {
            0 => anyhow::bail!("Invalid NTFS sectors per cluster: 0"),
            n if n <= 0x80 => n as u32,
            n => match 1u32.checked_shl(256 - n as u32) {
                Some(count) => count,
                None => anyhow::bail!("Invalid NTFS sectors per cluster byte: 0x{:02x}", n),
            },
        };
        if !sectors_per_cluster.is_power_of_two() {
            anyhow::bail!("Invalid NTFS sectors per cluster: {}", sectors_per_cluster);
        }

        let cluster_size = match (bytes_per_sector as u32).checked_mul(sectors_per_cluster) {
            Some(size) => size,
            None => anyhow::bail!(
                "NTFS cluster of {} sectors of {} bytes is too large",
                sectors_per_cluster,
                bytes_per_sector
            ),
        };
        if total_sectors.checked_mul(bytes_per_sector as u64).is_none() {
            anyhow::bail!("NTFS volume of {} sectors is too large", total_sectors);
        }
        let mft_record_size = decode_size(raw_record_size, cluster_size)?;
        let index_buffer_size = decode_size(raw_index_size, cluster_size)?;

        let boot = NtfsBootSector {
            bytes_per_sector,
            sectors_per_cluster,
            total_sectors,
            mft_lcn,
            mft_mirror_lcn,
            mft_record_size,
            index_buffer_size,
            serial_number,
        };

        if boot.mft_lcn >= boot.total_clusters() {
            anyhow::bail!(
                "MFT start cluster {} lies past the volume ({} clusters)",
                boot.mft_lcn,
                boot.total_clusters()
            );
        }

        Ok(boot)
    }

    pub fn cluster_size(&self) -> u64 {
        self.bytes_per_sector as u64 * self.sectors_per_cluster as u64
    }

    pub fn total_clusters(&self) -> u64 {
        self.total_sectors / self.sectors_per_cluster as u64
    }

    pub fn mft_offset(&self) -> u64 {
        self.mft_lcn * self.cluster_size()
    }
}

/// Signed size byte: positive counts clusters, negative n means 2^-n bytes
fn decode_size(raw: i8, cluster_size: u32) -> Result<u32> {
    let size = if raw > 0 {
        match (raw as u32).checked_mul(cluster_size) {
            Some(size) => size,
            None => anyhow::bail!("NTFS structure of {} clusters is too large", raw),
        }
    } else {
        let shift = -(raw as i32);
        if !(8..=31).contains(&shift) {
            anyhow::bail!("Invalid NTFS size encoding: {}", raw);
        }
        1u32 << shift
    };
    if !size.is_power_of_two() || size < 256 {
        anyhow::bail!("Invalid NTFS structure size: {}", size);
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot_sector(sectors_per_cluster: u8, record_byte: i8) -> Vec<u8> {
        let mut data = vec![0u8; 512];
        data[0..3].copy_from_slice(&[0xEB, 0x52, 0x90]);
        data[3..11].copy_from_slice(NTFS_OEM_ID);
        data[0x0B..0x0D].copy_from_slice(&512u16.to_le_bytes());
        data[0x0D] = sectors_per_cluster;
        data[0x28..0x30].copy_from_slice(&20480u64.to_le_bytes());
        data[0x30..0x38].copy_from_slice(&16u64.to_le_bytes());
        data[0x38..0x40].copy_from_slice(&2u64.to_le_bytes());
        data[0x40] = record_byte as u8;
        data[0x44] = 1;
        data[0x48..0x50].copy_from_slice(&0xDEAD_BEEFu64.to_le_bytes());
        data[510] = 0x55;
        data[511] = 0xAA;
        data
    }

    #[test]
    fn test_negative_record_size_is_a_power_of_two() {
        let boot = NtfsBootSector::parse(&boot_sector(8, -10)).unwrap();
        assert_eq!(boot.cluster_size(), 4096);
        assert_eq!(boot.mft_record_size, 1024);
        assert_eq!(boot.index_buffer_size, 4096);
        assert_eq!(boot.mft_offset(), 16 * 4096);
        assert_eq!(boot.serial_number, 0xDEAD_BEEF);
    }

    #[test]
    fn test_positive_record_size_counts_clusters() {
        let boot = NtfsBootSector::parse(&boot_sector(1, 2)).unwrap();
        assert_eq!(boot.mft_record_size, 1024);
        assert_eq!(boot.index_buffer_size, 512);
    }

    #[test]
    fn test_rejects_foreign_sector() {
        let mut data = boot_sector(8, -10);
        data[3..11].copy_from_slice(b"MSDOS5.0");
        assert!(NtfsBootSector::parse(&data).is_err());

        let mut data = boot_sector(8, -10);
        data[0x30..0x38].copy_from_slice(&999_999u64.to_le_bytes());
        assert!(NtfsBootSector::parse(&data).is_err());
    }

    #[test]
    fn test_corrupt_cluster_geometry_is_an_error() {
        // 0x81..=0xE0 would shift by 32 or more
        for raw in [0x81u8, 0xA0, 0xE0] {
            assert!(NtfsBootSector::parse(&boot_sector(raw, -10)).is_err(), "0x{:02x}", raw);
        }

        // 2^31 sectors of 512 bytes overflows a u32 cluster size
        assert!(NtfsBootSector::parse(&boot_sector(0xE1, -10)).is_err());

        // 127 clusters of 2^14 sectors of 4 KiB overflows the record size
        let mut data = boot_sector(0xF2, 127);
        data[0x0B..0x0D].copy_from_slice(&4096u16.to_le_bytes());
        assert!(NtfsBootSector::parse(&data).is_err());

        let mut data = boot_sector(8, -10);
        data[0x28..0x30].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(NtfsBootSector::parse(&data).is_err());
    }
}
