//! ANT+ heart-rate broadcast payload decoding and protocol constants.
//!
//! Heart-rate monitors broadcast an 8-byte data page; with extended messages
//! enabled the driver appends a channel-ID trailer carrying the transmitting
//! device's number. Only the extended form identifies the sender, so the
//! wildcard scanner silently discards anything shorter. A driver running
//! without extended messages therefore never promotes anyone; enabling them
//! on the scanning channel is a hard requirement.

use bytes::Buf;

/// RF frequency offset: 2457 MHz, the ANT+ sports band.
pub const RF_FREQ: u8 = 57;

/// Channel period, ~4.06 Hz, the standard HRM broadcast rate.
pub const PERIOD: u16 = 8070;

/// ANT+ device type for heart-rate monitors.
pub const DEVICE_TYPE_HRM: u8 = 120;

/// Device number 0 matches any transmitter (wildcard search).
pub const WILDCARD_DEVICE_ID: u16 = 0;

/// Search timeout value meaning "search forever".
pub const SEARCH_TIMEOUT_INFINITE: u8 = 255;

/// ANT+ managed network key (public, published by the ANT+ alliance).
pub const ANT_PLUS_NETWORK_KEY: [u8; 8] = [0xB9, 0xA5, 0x21, 0xFB, 0xBD, 0x72, 0xC3, 0x45];

/// Minimum length of an extended broadcast: 8 data bytes + flag byte +
/// channel ID (device number LE u16, device type, transmission type).
pub const EXTENDED_PAYLOAD_LEN: usize = 13;

/// Offset of the instantaneous heart rate byte in the HRM data page.
const HEART_RATE_OFFSET: usize = 7;

/// Offset of the little-endian device number in the extended trailer.
const DEVICE_ID_OFFSET: usize = 9;

/// A heart-rate observation decoded from an extended wildcard broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub device_id: u16,
    pub heart_rate: u8,
}

/// Decode an extended broadcast payload into device id + heart rate.
///
/// Returns `None` for payloads shorter than the extended format; those carry
/// no device number and are useless for discovery.
pub fn decode_extended(payload: &[u8]) -> Option<Observation> {
    if payload.len() < EXTENDED_PAYLOAD_LEN {
        return None;
    }

    let heart_rate = payload[HEART_RATE_OFFSET];

    let mut buf = &payload[DEVICE_ID_OFFSET..];
    let device_id = buf.get_u16_le();

    Some(Observation {
        device_id,
        heart_rate,
    })
}

/// Decode the heart rate byte from a dedicated-channel broadcast.
///
/// Dedicated channels already know which device they are bound to, so the
/// plain 8-byte data page is enough.
pub fn decode_heart_rate(payload: &[u8]) -> Option<u8> {
    if payload.len() <= HEART_RATE_OFFSET {
        return None;
    }
    Some(payload[HEART_RATE_OFFSET])
}

/// Build an extended broadcast payload (used by the simulated driver and tests).
pub fn encode_extended(device_id: u16, heart_rate: u8) -> Vec<u8> {
    let mut payload = vec![0u8; EXTENDED_PAYLOAD_LEN];
    payload[HEART_RATE_OFFSET] = heart_rate;
    payload[8] = 0x80; // extended flag
    payload[DEVICE_ID_OFFSET] = (device_id & 0xFF) as u8;
    payload[DEVICE_ID_OFFSET + 1] = (device_id >> 8) as u8;
    payload[11] = DEVICE_TYPE_HRM;
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_extended_payload() {
        // Data page: HR=72 at byte 7; trailer: device 0x3039 (12345) LE
        let payload: Vec<u8> = vec![
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 72, // data page
            0x80, // flag
            0x39, 0x30, // device number (LE)
            120,  // device type
            0x01, // transmission type
        ];

        let obs = decode_extended(&payload).unwrap();
        assert_eq!(obs.device_id, 12345);
        assert_eq!(obs.heart_rate, 72);
    }

    #[test]
    fn test_short_payload_is_discarded() {
        // Legacy (non-extended) 8-byte page: no device number available
        let payload: Vec<u8> = vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 88];
        assert!(decode_extended(&payload).is_none());
    }

    #[test]
    fn test_dedicated_decode_needs_only_data_page() {
        let payload: Vec<u8> = vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 143];
        assert_eq!(decode_heart_rate(&payload), Some(143));
        assert_eq!(decode_heart_rate(&payload[..7]), None);
    }

    #[test]
    fn test_encode_decode_device_id_endianness() {
        let payload = encode_extended(0xABCD, 99);
        let obs = decode_extended(&payload).unwrap();
        assert_eq!(obs.device_id, 0xABCD);
        assert_eq!(obs.heart_rate, 99);
        // device number is little-endian on the wire
        assert_eq!(payload[9], 0xCD);
        assert_eq!(payload[10], 0xAB);
    }
}
