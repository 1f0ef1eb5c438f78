//! VF rate queries: decoding VF→PF CIR/PIR requests and building replies

use qat_rl_hw::pfvf;

use crate::error::{Result, RlError};

/// Which rate a VF asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateKind {
    /// Committed rate
    Cir,
    /// Peak rate
    Pir,
}

impl RateKind {
    /// Request message type for this rate
    pub const fn request_type(self) -> u8 {
        match self {
            Self::Cir => pfvf::VF2PF_MSGTYPE_CIR_REQ,
            Self::Pir => pfvf::VF2PF_MSGTYPE_PIR_REQ,
        }
    }

    /// Response message type for this rate
    pub const fn response_type(self) -> u8 {
        match self {
            Self::Cir => pfvf::PF2VF_MSGTYPE_CIR_RESP,
            Self::Pir => pfvf::PF2VF_MSGTYPE_PIR_RESP,
        }
    }
}

/// A decoded VF→PF rate query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRequest {
    /// Requested rate
    pub kind: RateKind,
    /// Asking VF
    pub vf: u32,
    /// Bank inside the VF, from the message data
    pub bank: u32,
}

impl RateRequest {
    /// Decode a message of type `msg_type` from `vf`
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a message type other than a CIR or PIR
    /// request.
    pub fn from_message(msg_type: u8, vf: u32, msg_data: u32) -> Result<Self> {
        let kind = match msg_type {
            pfvf::VF2PF_MSGTYPE_CIR_REQ => RateKind::Cir,
            pfvf::VF2PF_MSGTYPE_PIR_REQ => RateKind::Pir,
            other => {
                return Err(RlError::invalid_argument(format!(
                    "message type {other:#x} is not a rate query"
                )))
            }
        };
        Ok(Self {
            kind,
            vf,
            bank: msg_data,
        })
    }
}

/// PF→VF reply to a [`RateRequest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateResponse {
    /// `CIR_RESP` or `PIR_RESP`
    pub msg_type: u8,
    /// Rate above the bank number, see [`pfvf::encode_rate_response`]
    pub data: u32,
}

impl RateResponse {
    pub(crate) const fn new(kind: RateKind, value: u32, ring: u32, banks_per_vf: u32) -> Self {
        Self {
            msg_type: kind.response_type(),
            data: pfvf::encode_rate_response(value, ring, banks_per_vf),
        }
    }

    /// Rate carried by the reply
    pub const fn value(self) -> u32 {
        self.data >> pfvf::RL_MSGDATA_SHIFT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_rate_requests() {
        let req = RateRequest::from_message(pfvf::VF2PF_MSGTYPE_PIR_REQ, 3, 2).unwrap();
        assert_eq!(req.kind, RateKind::Pir);
        assert_eq!((req.vf, req.bank), (3, 2));
        assert!(RateRequest::from_message(0x01, 0, 0).is_err());
    }

    #[test]
    fn response_type_matches_kind() {
        let resp = RateResponse::new(RateKind::Cir, 4000, 13, 4);
        assert_eq!(resp.msg_type, pfvf::PF2VF_MSGTYPE_CIR_RESP);
        assert_eq!(resp.value(), 4000);
        assert_eq!(resp.data & 0b11, 1);
    }
}
