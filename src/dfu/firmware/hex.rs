//! Intel HEX to flat binary conversion.
//!
//! Supported record types:
//! - `00` Data
//! - `01` End of File
//! - `02` Extended Segment Address
//! - `04` Extended Linear Address
//!
//! Gaps are not supported: the returned binary ends at the first address
//! discontinuity. Bytes below `mbr_size` are dropped so that an image which
//! includes the MBR can be sent as a SoftDevice.

/// Record marker at the start of every line.
const START_CODE: u8 = b':';

const RECORD_DATA: u8 = 0x00;
const RECORD_END_OF_FILE: u8 = 0x01;
const RECORD_EXTENDED_SEGMENT_ADDRESS: u8 = 0x02;
const RECORD_EXTENDED_LINEAR_ADDRESS: u8 = 0x04;

/// Convert an Intel HEX file into a flat binary.
///
/// Returns `None` for empty or malformed input.
pub fn hex_to_bin(hex: &[u8], mbr_size: u32) -> Option<Vec<u8>> {
    if hex.is_empty() {
        return None;
    }

    let mut reader = HexReader { hex, offset: 0 };
    let mut bin = Vec::new();
    // Next expected absolute address; the upper 16 bits are the base.
    // Kept in u64 as a record may run past 0xFFFF_FFFF.
    let mut current_address: u64 = 0;

    while reader.offset < hex.len() {
        if hex[reader.offset] != START_CODE {
            return None;
        }
        reader.offset += 1;

        // Length (2), offset (4) and type (2) must follow
        if hex.len() <= reader.offset + 8 {
            return None;
        }
        let record_length = reader.byte()? as usize;
        let record_offset = reader.address()?;
        let record_type = reader.byte()?;

        // Data and checksum must fit as well
        if hex.len() < reader.offset + record_length * 2 + 2 {
            return None;
        }

        match record_type {
            RECORD_EXTENDED_LINEAR_ADDRESS => {
                let base = u64::from(reader.address()?) << 16;
                if !bin.is_empty() && base != current_address {
                    return Some(bin);
                }
                current_address = base;
                reader.skip_checksum();
            }
            RECORD_EXTENDED_SEGMENT_ADDRESS => {
                let base = u64::from(reader.address()?) << 4;
                if !bin.is_empty() && base != current_address {
                    return Some(bin);
                }
                current_address = base;
                reader.skip_checksum();
            }
            RECORD_END_OF_FILE => return Some(bin),
            RECORD_DATA => {
                let base = current_address & 0xFFFF_0000;
                let record_start = base + u64::from(record_offset);
                if !bin.is_empty() && current_address != record_start {
                    return Some(bin);
                }
                for i in 0..record_length as u64 {
                    let byte = reader.byte()?;
                    if record_start + i >= u64::from(mbr_size) {
                        bin.push(byte);
                    }
                }
                current_address = record_start + record_length as u64;
                reader.skip_checksum();
            }
            _ => reader.offset += record_length * 2 + 2,
        }

        reader.skip_line_ending();
    }

    Some(bin)
}

/// Cursor over the ASCII text of a HEX file.
struct HexReader<'a> {
    hex: &'a [u8],
    offset: usize,
}

impl HexReader<'_> {
    fn nibble(&self, index: usize) -> Option<u8> {
        let c = *self.hex.get(index)?;
        (c as char).to_digit(16).map(|d| d as u8)
    }

    fn byte(&mut self) -> Option<u8> {
        let high = self.nibble(self.offset)?;
        let low = self.nibble(self.offset + 1)?;
        self.offset += 2;
        Some((high << 4) | low)
    }

    fn address(&mut self) -> Option<u16> {
        let msb = self.byte()? as u16;
        let lsb = self.byte()? as u16;
        Some((msb << 8) | lsb)
    }

    fn skip_checksum(&mut self) {
        self.offset += 2;
    }

    fn skip_line_ending(&mut self) {
        if self.hex.get(self.offset) == Some(&b'\r') {
            self.offset += 1;
        }
        if self.hex.get(self.offset) == Some(&b'\n') {
            self.offset += 1;
        }
    }
}
