//! AN3155 frame encoding and response decoding.
//!
//! Every frame the host sends is protected by a single XOR byte:
//!
//! ```text
//! Command frame:        [CMD, CMD ^ 0xFF]
//! Address frame:        [A3, A2, A1, A0, A3^A2^A1^A0]          (big-endian)
//! Length-payload frame: [N-1, payload[0..N], XOR(N-1, payload)]  1 <= N <= 256
//! ```
//!
//! Erase commands carry a page list instead of a payload; the standard erase
//! uses one byte per page, the extended erase two big-endian bytes per page
//! plus special all-ones sentinels for mass and bank erase. The device
//! answers each frame with a single byte: ACK `0x79` or NACK `0x1F`.

use byteorder::{BigEndian, WriteBytesExt};

use crate::error::{Error, Result};

/// Byte the host sends to start the bootloader auto-baud handshake.
pub const SYNC: u8 = 0x7F;

/// Positive acknowledge.
pub const ACK: u8 = 0x79;

/// Negative acknowledge.
pub const NACK: u8 = 0x1F;

/// Maximum payload per read/write command (AN3155 limit).
pub const MAX_PAYLOAD: usize = 256;

/// Extended-erase sentinel: erase all of flash.
pub const EXT_ERASE_MASS: u16 = 0xFFFF;

/// Extended-erase sentinel: erase bank 1.
pub const EXT_ERASE_BANK1: u16 = 0xFFFE;

/// Extended-erase sentinel: erase bank 2.
pub const EXT_ERASE_BANK2: u16 = 0xFFFD;

/// XOR of all bytes in `data` (the AN3155 checksum).
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ b)
}

/// Encode a command frame: the opcode followed by its complement.
pub fn command_frame(opcode: u8) -> [u8; 2] {
    [opcode, opcode ^ 0xFF]
}

/// Encode an address frame: 4 big-endian bytes plus their XOR.
pub fn address_frame(address: u32) -> [u8; 5] {
    let mut frame = [0u8; 5];
    frame[..4].copy_from_slice(&address.to_be_bytes());
    frame[4] = xor_checksum(&frame[..4]);
    frame
}

/// Encode a read length frame: `[N-1, (N-1) ^ 0xFF]`.
pub fn length_frame(len: usize) -> Result<[u8; 2]> {
    if len == 0 || len > MAX_PAYLOAD {
        return Err(Error::Protocol(format!(
            "read length {len} outside 1..={MAX_PAYLOAD}"
        )));
    }
    let n = (len - 1) as u8;
    Ok([n, n ^ 0xFF])
}

/// Encode a write payload frame: `[N-1, payload, XOR(N-1, payload)]`.
pub fn payload_frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.is_empty() || payload.len() > MAX_PAYLOAD {
        return Err(Error::Protocol(format!(
            "payload length {} outside 1..={MAX_PAYLOAD}",
            payload.len()
        )));
    }
    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.push((payload.len() - 1) as u8);
    frame.extend_from_slice(payload);
    frame.push(xor_checksum(&frame));
    Ok(frame)
}

/// Encode a standard erase page list: `[N-1, pages, XOR]`.
pub fn erase_page_list(pages: &[u8]) -> Result<Vec<u8>> {
    if pages.is_empty() || pages.len() > 255 {
        return Err(Error::Protocol(format!(
            "standard erase supports 1..=255 pages, got {}",
            pages.len()
        )));
    }
    let mut frame = Vec::with_capacity(pages.len() + 2);
    frame.push((pages.len() - 1) as u8);
    frame.extend_from_slice(pages);
    frame.push(xor_checksum(&frame));
    Ok(frame)
}

/// Standard-erase mass sentinel: `[0xFF, 0x00]`.
pub fn erase_mass() -> [u8; 2] {
    [0xFF, 0x00]
}

/// Encode an extended erase page list: big-endian u16 count minus one,
/// big-endian u16 page numbers, XOR of everything.
pub fn extended_erase_list(pages: &[u16]) -> Result<Vec<u8>> {
    if pages.is_empty() || pages.len() > 0xFFF0 {
        return Err(Error::Protocol(format!(
            "extended erase supports 1..=65520 pages, got {}",
            pages.len()
        )));
    }
    let mut frame = Vec::with_capacity(2 + pages.len() * 2 + 1);
    // Writing to a Vec cannot fail.
    frame
        .write_u16::<BigEndian>((pages.len() - 1) as u16)
        .expect("vec write");
    for page in pages {
        frame.write_u16::<BigEndian>(*page).expect("vec write");
    }
    let checksum = xor_checksum(&frame);
    frame.push(checksum);
    Ok(frame)
}

/// Encode an extended-erase special frame (mass or bank erase sentinel).
pub fn extended_erase_special(sentinel: u16) -> [u8; 3] {
    let be = sentinel.to_be_bytes();
    [be[0], be[1], be[0] ^ be[1]]
}

/// Decoded single-byte bootloader response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// The device accepted the frame.
    Ack,
    /// The device rejected the frame.
    Nack,
}

/// Classify a response byte. Anything but ACK/NACK is line garbage.
pub fn decode_ack(byte: u8) -> Result<Ack> {
    match byte {
        ACK => Ok(Ack::Ack),
        NACK => Ok(Ack::Nack),
        other => Err(Error::Garbage { byte: other }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_xor() {
        assert_eq!(xor_checksum(&[]), 0);
        assert_eq!(xor_checksum(&[0xFF]), 0xFF);
        assert_eq!(xor_checksum(&[0x08, 0x00, 0x00, 0x00]), 0x08);
        assert_eq!(xor_checksum(&[0xAA, 0x55]), 0xFF);
    }

    #[test]
    fn command_frame_carries_complement() {
        assert_eq!(command_frame(0x00), [0x00, 0xFF]);
        assert_eq!(command_frame(0x31), [0x31, 0xCE]);
        assert_eq!(command_frame(0x44), [0x44, 0xBB]);
    }

    #[test]
    fn address_frame_is_big_endian_with_xor() {
        let frame = address_frame(0x0800_0000);
        assert_eq!(frame, [0x08, 0x00, 0x00, 0x00, 0x08]);

        let frame = address_frame(0x0800_1234);
        assert_eq!(&frame[..4], &[0x08, 0x00, 0x12, 0x34]);
        assert_eq!(frame[4], 0x08 ^ 0x12 ^ 0x34);
    }

    #[test]
    fn length_frame_encodes_n_minus_one() {
        assert_eq!(length_frame(1).unwrap(), [0x00, 0xFF]);
        assert_eq!(length_frame(256).unwrap(), [0xFF, 0x00]);
        assert!(length_frame(0).is_err());
        assert!(length_frame(257).is_err());
    }

    #[test]
    fn payload_frame_round_trip() {
        let payload = [0xDE, 0xAD, 0xBE, 0xEF];
        let frame = payload_frame(&payload).unwrap();
        assert_eq!(frame[0], 3);
        assert_eq!(&frame[1..5], &payload);
        // The final XOR makes the whole frame XOR to zero.
        assert_eq!(xor_checksum(&frame), 0);

        // Decode side: length byte + payload reconstructs the input.
        let n = frame[0] as usize + 1;
        assert_eq!(&frame[1..1 + n], &payload);
    }

    #[test]
    fn payload_frame_limits() {
        assert!(payload_frame(&[]).is_err());
        assert!(payload_frame(&[0u8; 257]).is_err());
        assert!(payload_frame(&[0u8; 256]).is_ok());
    }

    #[test]
    fn erase_page_list_encoding() {
        let frame = erase_page_list(&[0, 1, 2]).unwrap();
        assert_eq!(frame[0], 2);
        assert_eq!(&frame[1..4], &[0, 1, 2]);
        assert_eq!(xor_checksum(&frame), 0);
        assert_eq!(erase_mass(), [0xFF, 0x00]);
    }

    #[test]
    fn extended_erase_single_sector() {
        // One sector, number 0: count N-1 = 0x0000, page 0x0000, XOR 0x00.
        let frame = extended_erase_list(&[0]).unwrap();
        assert_eq!(frame, vec![0x00, 0x00, 0x00, 0x00, 0x00]);

        let frame = extended_erase_list(&[5]).unwrap();
        assert_eq!(frame, vec![0x00, 0x00, 0x00, 0x05, 0x05]);
    }

    #[test]
    fn extended_erase_sentinels() {
        assert_eq!(extended_erase_special(EXT_ERASE_MASS), [0xFF, 0xFF, 0x00]);
        assert_eq!(extended_erase_special(EXT_ERASE_BANK1), [0xFF, 0xFE, 0x01]);
        assert_eq!(extended_erase_special(EXT_ERASE_BANK2), [0xFF, 0xFD, 0x02]);
    }

    #[test]
    fn ack_decoding() {
        assert_eq!(decode_ack(0x79).unwrap(), Ack::Ack);
        assert_eq!(decode_ack(0x1F).unwrap(), Ack::Nack);
        assert!(matches!(
            decode_ack(0x42),
            Err(Error::Garbage { byte: 0x42 })
        ));
    }
}
