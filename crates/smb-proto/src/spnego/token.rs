//! SPNEGO negotiation tokens (RFC 4178 with the Microsoft NegTokenInit2 form)

use bytes::Bytes;

use crate::error::{SmbError, SmbResult};
use crate::spnego::der::{self, tag, Oid};

/// Hint name Windows servers put in NegTokenInit2
pub const NEG_HINT_NAME: &str = "not_defined_in_RFC4178@please_ignore";

/// negState of a NegTokenResp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegState {
    /// Negotiation finished successfully
    AcceptCompleted,
    /// More legs needed
    AcceptIncomplete,
    /// Negotiation failed
    Reject,
    /// Acceptor wants a mechListMIC
    RequestMic,
}

impl NegState {
    fn from_u8(value: u8) -> SmbResult<Self> {
        match value {
            0 => Ok(Self::AcceptCompleted),
            1 => Ok(Self::AcceptIncomplete),
            2 => Ok(Self::Reject),
            3 => Ok(Self::RequestMic),
            other => Err(SmbError::Protocol(format!("Invalid negState {other}"))),
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::AcceptCompleted => 0,
            Self::AcceptIncomplete => 1,
            Self::Reject => 2,
            Self::RequestMic => 3,
        }
    }
}

/// negHints of a NegTokenInit2
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NegHints {
    /// hintName
    pub hint_name: Option<String>,
    /// hintAddress
    pub hint_address: Option<Bytes>,
}

/// NegTokenInit / NegTokenInit2
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NegTokenInit {
    /// Offered mechanisms, most preferred first
    pub mech_types: Vec<Oid>,
    /// reqFlags BIT STRING content
    pub req_flags: Option<Bytes>,
    /// Optimistic token of the first mechanism
    pub mech_token: Option<Bytes>,
    /// Server hints (NegTokenInit2 only)
    pub neg_hints: Option<NegHints>,
    /// mechListMIC
    pub mech_list_mic: Option<Bytes>,
}

/// NegTokenResp
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NegTokenResp {
    /// Negotiation state
    pub neg_state: Option<NegState>,
    /// Mechanism the acceptor selected
    pub supported_mech: Option<Oid>,
    /// Mechanism token
    pub response_token: Option<Bytes>,
    /// mechListMIC
    pub mech_list_mic: Option<Bytes>,
}

/// SPNEGO token: initial or response choice
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationToken {
    /// First token, wrapped in the GSS-API initial context token framing
    Init(NegTokenInit),
    /// Every later token
    Resp(NegTokenResp),
}

/// DER encoding of a MechTypeList, the data covered by mechListMIC
pub fn encode_mech_list(mechs: &[Oid]) -> Vec<u8> {
    let mut out = Vec::new();
    der::write_nested(tag::SEQUENCE, &mut out, |seq| {
        for oid in mechs {
            oid.write(seq);
        }
    });
    out
}

impl NegotiationToken {
    /// Encode to DER
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            NegotiationToken::Init(init) => {
                der::write_nested(tag::APPLICATION_0, &mut out, |app| {
                    Oid::SPNEGO.write(app);
                    der::write_nested(tag::context(0), app, |choice| init.write(choice));
                });
            }
            NegotiationToken::Resp(resp) => {
                der::write_nested(tag::context(1), &mut out, |choice| resp.write(choice));
            }
        }
        out
    }

    /// Decode from DER
    pub fn decode(input: &[u8]) -> SmbResult<Self> {
        let mut cursor = input;
        let (outer, content) = der::read_tlv(&mut cursor)?;
        match outer {
            tag::APPLICATION_0 => {
                let mut app = content;
                let oid = Oid::from_der_content(der::expect_tlv(&mut app, tag::OID)?)?;
                if oid != Oid::SPNEGO {
                    return Err(SmbError::Protocol(format!("Not a SPNEGO token: {oid}")));
                }
                let choice = der::expect_tlv(&mut app, tag::context(0))?;
                NegTokenInit::parse(choice).map(NegotiationToken::Init)
            }
            t if t == tag::context(0) => NegTokenInit::parse(content).map(NegotiationToken::Init),
            t if t == tag::context(1) => NegTokenResp::parse(content).map(NegotiationToken::Resp),
            other => Err(SmbError::Protocol(format!(
                "Unexpected SPNEGO token tag 0x{other:02X}"
            ))),
        }
    }
}

impl NegTokenInit {
    fn write(&self, out: &mut Vec<u8>) {
        der::write_nested(tag::SEQUENCE, out, |seq| {
            der::write_tlv(tag::context(0), &encode_mech_list(&self.mech_types), seq);
            if let Some(flags) = &self.req_flags {
                der::write_nested(tag::context(1), seq, |f| {
                    der::write_tlv(tag::BIT_STRING, flags, f)
                });
            }
            if let Some(token) = &self.mech_token {
                der::write_nested(tag::context(2), seq, |t| {
                    der::write_tlv(tag::OCTET_STRING, token, t)
                });
            }
            let mic_tag = if let Some(hints) = &self.neg_hints {
                der::write_nested(tag::context(3), seq, |h| hints.write(h));
                tag::context(4)
            } else {
                tag::context(3)
            };
            if let Some(mic) = &self.mech_list_mic {
                der::write_nested(mic_tag, seq, |m| der::write_tlv(tag::OCTET_STRING, mic, m));
            }
        });
    }

    fn parse(choice: &[u8]) -> SmbResult<Self> {
        let mut outer = choice;
        let mut seq = der::expect_tlv(&mut outer, tag::SEQUENCE)?;
        let mut init = NegTokenInit::default();

        while !seq.is_empty() {
            let (field, content) = der::read_tlv(&mut seq)?;
            let mut inner = content;
            match field {
                t if t == tag::context(0) => {
                    let mut list = der::expect_tlv(&mut inner, tag::SEQUENCE)?;
                    while !list.is_empty() {
                        let oid = der::expect_tlv(&mut list, tag::OID)?;
                        init.mech_types.push(Oid::from_der_content(oid)?);
                    }
                }
                t if t == tag::context(1) => {
                    let flags = der::expect_tlv(&mut inner, tag::BIT_STRING)?;
                    init.req_flags = Some(Bytes::copy_from_slice(flags));
                }
                t if t == tag::context(2) => {
                    let token = der::expect_tlv(&mut inner, tag::OCTET_STRING)?;
                    init.mech_token = Some(Bytes::copy_from_slice(token));
                }
                t if t == tag::context(3) => {
                    // [3] is mechListMIC in RFC 4178 and negHints in NegTokenInit2
                    if der::peek_tag(inner) == Some(tag::SEQUENCE) {
                        init.neg_hints = Some(NegHints::parse(inner)?);
                    } else {
                        let mic = der::expect_tlv(&mut inner, tag::OCTET_STRING)?;
                        init.mech_list_mic = Some(Bytes::copy_from_slice(mic));
                    }
                }
                t if t == tag::context(4) => {
                    let mic = der::expect_tlv(&mut inner, tag::OCTET_STRING)?;
                    init.mech_list_mic = Some(Bytes::copy_from_slice(mic));
                }
                other => {
                    return Err(SmbError::Protocol(format!(
                        "Unknown NegTokenInit field 0x{other:02X}"
                    )))
                }
            }
        }

        if init.mech_types.is_empty() {
            return Err(SmbError::Protocol(
                "NegTokenInit without mechTypes".to_string(),
            ));
        }
        Ok(init)
    }
}

impl NegHints {
    fn write(&self, out: &mut Vec<u8>) {
        der::write_nested(tag::SEQUENCE, out, |seq| {
            if let Some(name) = &self.hint_name {
                der::write_nested(tag::context(0), seq, |n| {
                    der::write_tlv(tag::GENERAL_STRING, name.as_bytes(), n)
                });
            }
            if let Some(address) = &self.hint_address {
                der::write_nested(tag::context(1), seq, |a| {
                    der::write_tlv(tag::OCTET_STRING, address, a)
                });
            }
        });
    }

    fn parse(input: &[u8]) -> SmbResult<Self> {
        let mut outer = input;
        let mut seq = der::expect_tlv(&mut outer, tag::SEQUENCE)?;
        let mut hints = NegHints::default();
        while !seq.is_empty() {
            let (field, content) = der::read_tlv(&mut seq)?;
            let mut inner = content;
            match field {
                t if t == tag::context(0) => {
                    let name = der::expect_tlv(&mut inner, tag::GENERAL_STRING)?;
                    hints.hint_name = Some(String::from_utf8_lossy(name).into_owned());
                }
                t if t == tag::context(1) => {
                    let address = der::expect_tlv(&mut inner, tag::OCTET_STRING)?;
                    hints.hint_address = Some(Bytes::copy_from_slice(address));
                }
                _ => {}
            }
        }
        Ok(hints)
    }
}

impl NegTokenResp {
    fn write(&self, out: &mut Vec<u8>) {
        der::write_nested(tag::SEQUENCE, out, |seq| {
            if let Some(state) = self.neg_state {
                der::write_nested(tag::context(0), seq, |s| {
                    der::write_tlv(tag::ENUMERATED, &[state.as_u8()], s)
                });
            }
            if let Some(mech) = &self.supported_mech {
                der::write_nested(tag::context(1), seq, |m| mech.write(m));
            }
            if let Some(token) = &self.response_token {
                der::write_nested(tag::context(2), seq, |t| {
                    der::write_tlv(tag::OCTET_STRING, token, t)
                });
            }
            if let Some(mic) = &self.mech_list_mic {
                der::write_nested(tag::context(3), seq, |m| {
                    der::write_tlv(tag::OCTET_STRING, mic, m)
                });
            }
        });
    }

    fn parse(choice: &[u8]) -> SmbResult<Self> {
        let mut outer = choice;
        let mut seq = der::expect_tlv(&mut outer, tag::SEQUENCE)?;
        let mut resp = NegTokenResp::default();

        while !seq.is_empty() {
            let (field, content) = der::read_tlv(&mut seq)?;
            let mut inner = content;
            match field {
                t if t == tag::context(0) => {
                    let state = der::expect_tlv(&mut inner, tag::ENUMERATED)?;
                    let value = match state {
                        [v] => *v,
                        _ => return Err(SmbError::Protocol("Malformed negState".to_string())),
                    };
                    resp.neg_state = Some(NegState::from_u8(value)?);
                }
                t if t == tag::context(1) => {
                    let oid = der::expect_tlv(&mut inner, tag::OID)?;
                    resp.supported_mech = Some(Oid::from_der_content(oid)?);
                }
                t if t == tag::context(2) => {
                    let token = der::expect_tlv(&mut inner, tag::OCTET_STRING)?;
                    resp.response_token = Some(Bytes::copy_from_slice(token));
                }
                t if t == tag::context(3) => {
                    let mic = der::expect_tlv(&mut inner, tag::OCTET_STRING)?;
                    resp.mech_list_mic = Some(Bytes::copy_from_slice(mic));
                }
                other => {
                    return Err(SmbError::Protocol(format!(
                        "Unknown NegTokenResp field 0x{other:02X}"
                    )))
                }
            }
        }
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_wire_prefix() {
        let token = NegotiationToken::Init(NegTokenInit {
            mech_types: vec![Oid::NTLM],
            mech_token: Some(Bytes::from_static(b"NTLMSSP\0")),
            ..Default::default()
        });
        let encoded = token.encode();
        assert_eq!(encoded[0], 0x60);
        assert_eq!(
            &encoded[2..10],
            &[0x06, 0x06, 0x2b, 0x06, 0x01, 0x05, 0x05, 0x02]
        );
        assert_eq!(encoded[10], 0xA0);
        assert_eq!(encoded[12], 0x30);
        assert_eq!(NegotiationToken::decode(&encoded).unwrap(), token);
    }

    #[test]
    fn test_init2_with_hints() {
        let token = NegotiationToken::Init(NegTokenInit {
            mech_types: vec![Oid::NEGOEX, Oid::MS_KERBEROS, Oid::KERBEROS, Oid::NTLM],
            neg_hints: Some(NegHints {
                hint_name: Some(NEG_HINT_NAME.to_string()),
                hint_address: None,
            }),
            mech_list_mic: Some(Bytes::from_static(b"mic")),
            ..Default::default()
        });
        let decoded = NegotiationToken::decode(&token.encode()).unwrap();
        assert_eq!(decoded, token);
    }

    #[test]
    fn test_server_hint_vector() {
        // NegTokenInit2 as sent in a NEGOTIATE response offering NTLM
        let wire = hex::decode(concat!(
            "604806062b0601050502a03e303ca00e300c060a2b06010401823702020aa32a",
            "3028a0261b246e6f745f646566696e65645f696e5f5246433431373840706c65",
            "6173655f69676e6f7265",
        ))
        .unwrap();
        let expected = NegotiationToken::Init(NegTokenInit {
            mech_types: vec![Oid::NTLM],
            neg_hints: Some(NegHints {
                hint_name: Some(NEG_HINT_NAME.to_string()),
                hint_address: None,
            }),
            ..Default::default()
        });
        assert_eq!(NegotiationToken::decode(&wire).unwrap(), expected);
        assert_eq!(expected.encode(), wire);
        assert!(NegotiationToken::decode(&wire[..40]).is_err());
    }

    #[test]
    fn test_resp_round_trip() {
        let token = NegotiationToken::Resp(NegTokenResp {
            neg_state: Some(NegState::AcceptIncomplete),
            supported_mech: Some(Oid::NTLM),
            response_token: Some(Bytes::from(vec![0xAB; 200])),
            mech_list_mic: None,
        });
        let encoded = token.encode();
        assert_eq!(encoded[0], 0xA1);
        assert_eq!(NegotiationToken::decode(&encoded).unwrap(), token);
    }

    #[test]
    fn test_reject_only() {
        let token = NegotiationToken::Resp(NegTokenResp {
            neg_state: Some(NegState::Reject),
            ..Default::default()
        });
        assert_eq!(token.encode(), vec![0xA1, 0x07, 0x30, 0x05, 0xA0, 0x03, 0x0A, 0x01, 0x02]);
    }

    #[test]
    fn test_invalid_neg_state() {
        let wire = [0xA1, 0x07, 0x30, 0x05, 0xA0, 0x03, 0x0A, 0x01, 0x09];
        assert!(NegotiationToken::decode(&wire).is_err());
    }

    #[test]
    fn test_not_spnego_oid() {
        let mut wire = Vec::new();
        der::write_nested(tag::APPLICATION_0, &mut wire, |app| {
            Oid::KERBEROS.write(app);
        });
        assert!(NegotiationToken::decode(&wire).is_err());
    }
}
