//! PF↔VF rate query framing.
//!
//! A VF asks the PF for the CIR or PIR of one of its own rings. The request
//! data is the bank number inside the VF; the response packs the rate above
//! the bank number:
//!
//! ```text
//! response data:  value << RL_MSGDATA_SHIFT | (ring % banks_per_vf)
//! ```

/// VF→PF CIR request.
pub const VF2PF_MSGTYPE_CIR_REQ: u8 = 0x0B;

/// VF→PF PIR request.
pub const VF2PF_MSGTYPE_PIR_REQ: u8 = 0x0C;

/// PF→VF CIR response.
pub const PF2VF_MSGTYPE_CIR_RESP: u8 = 0x0D;

/// PF→VF PIR response.
pub const PF2VF_MSGTYPE_PIR_RESP: u8 = 0x0E;

/// Bits reserved for the bank number in a response.
pub const RL_MSGDATA_SHIFT: u32 = 2;

/// Encode a CIR/PIR response payload.
#[must_use]
pub const fn encode_rate_response(value: u32, ring: u32, banks_per_vf: u32) -> u32 {
    (value << RL_MSGDATA_SHIFT) | (ring % banks_per_vf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_keeps_bank_in_low_bits() {
        let word = encode_rate_response(1000, 13, 4);
        assert_eq!(word & 0b11, 1);
        assert_eq!(word >> RL_MSGDATA_SHIFT, 1000);
    }
}
