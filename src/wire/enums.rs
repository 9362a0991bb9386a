//! DNS opcode, RCODE and QTYPE values needed to classify and log queries.
//!
//! Only the subset of the IANA registries that the proxy actually inspects is
//! modeled. Anything else round-trips through `Other(u16)`/`Other(u8)` so the
//! codec never rejects a query type it doesn't recognize.

use std::fmt;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum QType {
    #[default]
    A,
    NS,
    CNAME,
    SOA,
    PTR,
    MX,
    TXT,
    AAAA,
    SRV,
    NAPTR,
    OPT,
    DS,
    DNSKEY,
    CAA,
    HTTPS,
    SVCB,
    AXFR,
    IXFR,
    ANY,
    Other(u16),
}

impl From<u16> for QType {
    fn from(value: u16) -> Self {
        match value {
            1 => QType::A,
            2 => QType::NS,
            5 => QType::CNAME,
            6 => QType::SOA,
            12 => QType::PTR,
            15 => QType::MX,
            16 => QType::TXT,
            28 => QType::AAAA,
            33 => QType::SRV,
            35 => QType::NAPTR,
            41 => QType::OPT,
            43 => QType::DS,
            48 => QType::DNSKEY,
            257 => QType::CAA,
            65 => QType::HTTPS,
            64 => QType::SVCB,
            252 => QType::AXFR,
            251 => QType::IXFR,
            255 => QType::ANY,
            other => QType::Other(other),
        }
    }
}

impl From<QType> for u16 {
    fn from(value: QType) -> Self {
        match value {
            QType::A => 1,
            QType::NS => 2,
            QType::CNAME => 5,
            QType::SOA => 6,
            QType::PTR => 12,
            QType::MX => 15,
            QType::TXT => 16,
            QType::AAAA => 28,
            QType::SRV => 33,
            QType::NAPTR => 35,
            QType::OPT => 41,
            QType::DS => 43,
            QType::DNSKEY => 48,
            QType::CAA => 257,
            QType::HTTPS => 65,
            QType::SVCB => 64,
            QType::AXFR => 252,
            QType::IXFR => 251,
            QType::ANY => 255,
            QType::Other(v) => v,
        }
    }
}

impl fmt::Display for QType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QType::Other(v) => write!(f, "TYPE{v}"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// RFC 1035 §4.1.1 opcodes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Opcode {
    #[default]
    Query,
    IQuery,
    Status,
    Notify,
    Update,
    Other(u8),
}

impl From<u8> for Opcode {
    fn from(value: u8) -> Self {
        match value {
            0 => Opcode::Query,
            1 => Opcode::IQuery,
            2 => Opcode::Status,
            4 => Opcode::Notify,
            5 => Opcode::Update,
            other => Opcode::Other(other),
        }
    }
}

/// RFC 1035 §4.1.1 response codes, extended with the handful of EDNS-era
/// values the proxy needs to distinguish ([`ResponseCode::Refused`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseCode {
    NoError,
    FormatError,
    ServerFailure,
    NameError,
    NotImplemented,
    Refused,
    Other(u8),
}

impl ResponseCode {
    pub const SERVFAIL: u8 = 2;

    pub fn as_u8(self) -> u8 {
        match self {
            ResponseCode::NoError => 0,
            ResponseCode::FormatError => 1,
            ResponseCode::ServerFailure => 2,
            ResponseCode::NameError => 3,
            ResponseCode::NotImplemented => 4,
            ResponseCode::Refused => 5,
            ResponseCode::Other(v) => v,
        }
    }
}

impl From<u8> for ResponseCode {
    fn from(value: u8) -> Self {
        match value {
            0 => ResponseCode::NoError,
            1 => ResponseCode::FormatError,
            2 => ResponseCode::ServerFailure,
            3 => ResponseCode::NameError,
            4 => ResponseCode::NotImplemented,
            5 => ResponseCode::Refused,
            other => ResponseCode::Other(other),
        }
    }
}
