//! Binary wire format for contexts and ciphertexts.
//!
//! ```text
//! [4 bytes] magic: b"HEVL"
//! [1 byte]  format version: 1
//! [1 byte]  payload kind: 1=context, 2=ciphertext
//! [1 byte]  scheme id: 1=CKKS
//! [1 byte]  flags (context: bit0 relin keys, bit1 secret key, bit2 rotation
//!           keys; ciphertext: 0)
//! [4 bytes] payload length (little-endian u32)
//! [rest]    bincode payload
//! ```
//!
//! Secret-key material is written only when asked for explicitly, and the
//! server-side decoder refuses any blob that carries it.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ckks::ciphertext::Ciphertext;
use crate::ckks::keys::{GaloisKeys, PublicKey, RelinKeys, SecretKey, SwitchKey};
use crate::ckks::params::{CkksParams, SchemeId};
use crate::ckks::poly::Ring;
use crate::context::{EncryptionContext, PublicContext};

/// Magic bytes identifying a wire blob.
pub const MAGIC: &[u8; 4] = b"HEVL";

/// Current structural version.
pub const FORMAT_VERSION: u8 = 1;

/// 4 (magic) + 1 (version) + 1 (kind) + 1 (scheme) + 1 (flags) + 4 (length).
pub const HEADER_SIZE: usize = 12;

/// Largest accepted payload (64 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

const FLAG_RELIN_KEYS: u8 = 0b01;
const FLAG_SECRET_KEY: u8 = 0b10;
const FLAG_GALOIS_KEYS: u8 = 0b100;
const KNOWN_CONTEXT_FLAGS: u8 = FLAG_RELIN_KEYS | FLAG_SECRET_KEY | FLAG_GALOIS_KEYS;

/// What a blob contains.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadKind {
    Context = 1,
    Ciphertext = 2,
}

impl PayloadKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(PayloadKind::Context),
            2 => Some(PayloadKind::Ciphertext),
            _ => None,
        }
    }
}

/// Parsed blob header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub kind: PayloadKind,
    pub scheme: SchemeId,
    pub flags: u8,
    pub payload_len: u32,
}

impl Header {
    pub fn has_secret_key(&self) -> bool {
        self.kind == PayloadKind::Context && self.flags & FLAG_SECRET_KEY != 0
    }

    pub fn has_relin_keys(&self) -> bool {
        self.kind == PayloadKind::Context && self.flags & FLAG_RELIN_KEYS != 0
    }

    pub fn has_galois_keys(&self) -> bool {
        self.kind == PayloadKind::Context && self.flags & FLAG_GALOIS_KEYS != 0
    }
}

/// Errors from encoding or decoding wire blobs.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed context: {0}")]
    MalformedContext(String),

    #[error("malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    #[error("context carries secret key material")]
    SecretKeyPresent,

    #[error("serialization failed: {0}")]
    Serialize(#[from] bincode::Error),
}

#[derive(Serialize)]
struct ContextPayloadRef<'a> {
    params: &'a CkksParams,
    public_key: &'a PublicKey,
    relin_keys: Option<&'a RelinKeys>,
    galois_keys: Option<&'a GaloisKeys>,
    secret_key: Option<&'a SecretKey>,
}

impl ContextPayloadRef<'_> {
    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.relin_keys.is_some() {
            flags |= FLAG_RELIN_KEYS;
        }
        if self.secret_key.is_some() {
            flags |= FLAG_SECRET_KEY;
        }
        if self.galois_keys.is_some() {
            flags |= FLAG_GALOIS_KEYS;
        }
        flags
    }
}

#[derive(Deserialize)]
struct ContextPayload {
    params: CkksParams,
    public_key: PublicKey,
    relin_keys: Option<RelinKeys>,
    galois_keys: Option<GaloisKeys>,
    secret_key: Option<SecretKey>,
}

/// Serialize a client context. The secret key is written only when
/// `include_secret` is set and the context holds one.
pub fn encode_context(ctx: &EncryptionContext, include_secret: bool) -> Result<Vec<u8>, CodecError> {
    let secret_key = if include_secret { ctx.secret_key() } else { None };
    let payload = ContextPayloadRef {
        params: ctx.params(),
        public_key: ctx.public_key(),
        relin_keys: ctx.relin_keys(),
        galois_keys: ctx.galois_keys(),
        secret_key,
    };
    frame(PayloadKind::Context, payload.flags(), &payload)
}

/// Serialize a public context.
pub fn encode_public_context(ctx: &PublicContext) -> Result<Vec<u8>, CodecError> {
    let payload = ContextPayloadRef {
        params: ctx.params(),
        public_key: ctx.public_key(),
        relin_keys: ctx.relin_keys(),
        galois_keys: ctx.galois_keys(),
        secret_key: None,
    };
    frame(PayloadKind::Context, payload.flags(), &payload)
}

/// Serialize a ciphertext.
pub fn encode_ciphertext(ct: &Ciphertext) -> Result<Vec<u8>, CodecError> {
    frame(PayloadKind::Ciphertext, 0, ct)
}

/// Decode a context that may hold a secret key. Client side only.
pub fn decode_context(data: &[u8]) -> Result<EncryptionContext, CodecError> {
    let (header, body) = split(data, PayloadKind::Context).map_err(CodecError::MalformedContext)?;
    let (public, secret_key) = parse_context_payload(header, body)?;
    if let Some(sk) = &secret_key {
        let params = public.params();
        let ring = Ring::new(params).map_err(|e| CodecError::MalformedContext(e.to_string()))?;
        let basis = ring.extended(params.max_level());
        let ternary = sk.s.is_reduced(&basis, params.degree())
            && sk.s.to_centered_f64(&basis).iter().all(|c| c.abs() <= 1.0);
        if !ternary {
            return Err(CodecError::MalformedContext(
                "secret key is not a ternary polynomial of the ring dimension".into(),
            ));
        }
    }
    Ok(EncryptionContext::from_parts(public, secret_key))
}

/// Decode a context on the server. Any secret key material, announced in
/// the header or found in the payload, rejects the whole blob.
pub fn decode_public_context(data: &[u8]) -> Result<PublicContext, CodecError> {
    let (header, body) = split(data, PayloadKind::Context).map_err(CodecError::MalformedContext)?;
    if header.has_secret_key() {
        return Err(CodecError::SecretKeyPresent);
    }
    let (public, secret_key) = parse_context_payload(header, body)?;
    if secret_key.is_some() {
        return Err(CodecError::SecretKeyPresent);
    }
    Ok(public)
}

/// Decode a ciphertext. Checks only what the blob can establish on its own;
/// compatibility with a context is `PublicContext::check_compatible`.
pub fn decode_ciphertext(data: &[u8]) -> Result<Ciphertext, CodecError> {
    let malformed = CodecError::MalformedCiphertext;
    let (header, body) = split(data, PayloadKind::Ciphertext).map_err(malformed)?;
    if header.flags != 0 {
        return Err(malformed(format!("unexpected flags {:#04x}", header.flags)));
    }
    let ct: Ciphertext = deserialize_exact(body).map_err(|e| malformed(format!("payload: {}", e)))?;

    let n = ct.degree();
    if !n.is_power_of_two() || ct.c1.degree() != n {
        return Err(malformed(format!(
            "ring elements of {} and {} coefficients",
            n,
            ct.c1.degree()
        )));
    }
    let channels = ct.level + 1;
    for (name, poly) in [("c0", &ct.c0), ("c1", &ct.c1)] {
        if poly.channels() != channels || poly.residues.iter().any(|r| r.len() != n) {
            return Err(malformed(format!(
                "{} does not hold {} channels of {} coefficients",
                name, channels, n
            )));
        }
    }
    if !ct.scale.is_finite() || ct.scale < 1.0 {
        return Err(malformed(format!("scale {} is not usable", ct.scale)));
    }
    if !ct.layout.fits(n / 2) {
        return Err(malformed(format!(
            "layout {:?} does not fit {} slots",
            ct.layout,
            n / 2
        )));
    }
    Ok(ct)
}

/// Parse and check a blob header without touching the payload.
pub fn read_header(data: &[u8]) -> Result<Header, String> {
    if data.len() < HEADER_SIZE {
        return Err(format!(
            "{} bytes is shorter than the {}-byte header",
            data.len(),
            HEADER_SIZE
        ));
    }
    if &data[..4] != MAGIC {
        return Err("bad magic bytes".into());
    }
    let version = data[4];
    if version != FORMAT_VERSION {
        return Err(format!("unsupported format version {}", version));
    }
    let kind = PayloadKind::from_byte(data[5])
        .ok_or_else(|| format!("unknown payload kind {}", data[5]))?;
    let scheme =
        SchemeId::from_byte(data[6]).ok_or_else(|| format!("unsupported scheme id {}", data[6]))?;
    let flags = data[7];
    let payload_len = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
    Ok(Header {
        version,
        kind,
        scheme,
        flags,
        payload_len,
    })
}

fn split(data: &[u8], expected: PayloadKind) -> Result<(Header, &[u8]), String> {
    let header = read_header(data)?;
    if header.kind != expected {
        return Err(format!("expected a {:?} blob, found {:?}", expected, header.kind));
    }
    let len = header.payload_len as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(format!(
            "payload of {} bytes exceeds the {} byte limit",
            len, MAX_PAYLOAD_SIZE
        ));
    }
    let body = &data[HEADER_SIZE..];
    if body.len() != len {
        return Err(format!(
            "header announces {} payload bytes, found {}",
            len,
            body.len()
        ));
    }
    Ok((header, body))
}

fn frame<T: Serialize + ?Sized>(kind: PayloadKind, flags: u8, payload: &T) -> Result<Vec<u8>, CodecError> {
    let body = bincode::serialize(payload)?;
    if body.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::Serialize(Box::new(bincode::ErrorKind::Custom(
            format!("payload of {} bytes exceeds the wire limit", body.len()),
        ))));
    }
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(MAGIC);
    out.push(FORMAT_VERSION);
    out.push(kind as u8);
    out.push(SchemeId::Ckks.as_byte());
    out.push(flags);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Same encoding as `bincode::serialize`, but the payload must be consumed
/// exactly: appended bytes are an error, not ignored.
fn deserialize_exact<T: DeserializeOwned>(body: &[u8]) -> Result<T, bincode::Error> {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
        .deserialize(body)
}

fn parse_context_payload(
    header: Header,
    body: &[u8],
) -> Result<(PublicContext, Option<SecretKey>), CodecError> {
    let malformed = CodecError::MalformedContext;
    if header.flags & !KNOWN_CONTEXT_FLAGS != 0 {
        return Err(malformed(format!("unknown flags {:#04x}", header.flags)));
    }
    let payload: ContextPayload =
        deserialize_exact(body).map_err(|e| malformed(format!("payload: {}", e)))?;

    if payload.secret_key.is_some() && !header.has_secret_key() {
        // An unannounced secret key is still a secret key.
        return Err(CodecError::SecretKeyPresent);
    }
    if payload.relin_keys.is_some() != header.has_relin_keys() {
        return Err(malformed("relinearization key flag disagrees with payload".into()));
    }
    if payload.galois_keys.is_some() != header.has_galois_keys() {
        return Err(malformed("rotation key flag disagrees with payload".into()));
    }
    if payload.secret_key.is_none() && header.has_secret_key() {
        return Err(malformed("secret key flag set without a secret key".into()));
    }

    let params = &payload.params;
    params.validate().map_err(|e| malformed(e.to_string()))?;
    let ring = Ring::new(params).map_err(|e| malformed(e.to_string()))?;
    let n = params.degree();
    let top = params.max_level();
    let data = ring.level(top);
    let extended = ring.extended(top);

    let pk = &payload.public_key;
    if !pk.b.is_reduced(&data, n) || !pk.a.is_reduced(&data, n) {
        return Err(malformed("public key does not match the parameters".into()));
    }
    let well_formed = |key: &SwitchKey| {
        key.parts.len() == top + 1
            && key
                .parts
                .iter()
                .all(|(b, a)| b.is_reduced(&extended, n) && a.is_reduced(&extended, n))
    };
    if let Some(rk) = &payload.relin_keys {
        if !well_formed(&rk.key) {
            return Err(malformed(
                "relinearization keys do not match the parameters".into(),
            ));
        }
    }
    if let Some(gk) = &payload.galois_keys {
        let slots = params.slot_count();
        for (&steps, key) in &gk.keys {
            if !steps.is_power_of_two() || steps >= slots || !well_formed(key) {
                return Err(malformed(format!(
                    "rotation key for step {} does not match the parameters",
                    steps
                )));
            }
        }
    }

    let public = PublicContext::from_parts(
        payload.params,
        payload.public_key,
        payload.relin_keys,
        payload.galois_keys,
    );
    Ok((public, payload.secret_key))
}
