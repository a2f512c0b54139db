use crate::config::{SignatureConfig, SignerInfo};
use crate::error::RenderError;
use chrono::Utc;
use cms::builder::{SignedDataBuilder, SignerInfoBuilder};
use cms::cert::{CertificateChoices, IssuerAndSerialNumber};
use cms::signed_data::{EncapsulatedContentInfo, SignerIdentifier};
use der::{DecodePem, Encode};
use lopdf::{Dictionary, Document, Object, StringFormat};
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use x509_cert::spki::AlgorithmIdentifierOwned;
use x509_cert::Certificate;

/// Hex digits reserved for the CMS container inside the /Contents string.
const SIG_CONTENTS_LEN: usize = 8192;

/// Sentinels wide enough for any real offset; rewritten in place after
/// serialization so the surrounding bytes keep their positions.
const BYTE_RANGE_SENTINELS: [i64; 3] = [1_000_000_001, 1_000_000_002, 1_000_000_003];

/// Applies a detached PKCS#7 signature to a finished document through an
/// invisible signature field, leaving every page object untouched.
pub struct PdfSigner {
    key: RsaPrivateKey,
    certificate: Certificate,
    info: SignerInfo,
}

impl PdfSigner {
    pub fn from_config(config: &SignatureConfig) -> Result<Self, RenderError> {
        let key_pem = std::fs::read_to_string(&config.key_path)?;
        let key = RsaPrivateKey::from_pkcs8_encrypted_pem(&key_pem, config.password.as_bytes())
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(&key_pem))
            .map_err(|e| RenderError::Signature(format!("signing key: {e}")))?;

        let cert_pem = std::fs::read_to_string(&config.cert_path)?;
        let certificate = Certificate::from_pem(cert_pem.as_bytes())
            .map_err(|e| RenderError::Signature(format!("signing certificate: {e}")))?;

        Ok(Self {
            key,
            certificate,
            info: config.info.clone(),
        })
    }

    pub fn sign(&self, pdf: &[u8]) -> Result<Vec<u8>, RenderError> {
        let mut doc = Document::load_mem(pdf)
            .map_err(|e| RenderError::Signature(format!("document parse: {e}")))?;
        add_signature_objects(&mut doc, &self.info)?;

        let mut buf = Vec::new();
        doc.save_to(&mut buf)
            .map_err(|e| RenderError::Signature(format!("document serialize: {e}")))?;

        let (contents_start, contents_end) = locate_contents(&buf)?;
        let ranges = [
            0,
            contents_start as i64,
            contents_end as i64,
            (buf.len() - contents_end) as i64,
        ];
        patch_byte_range(&mut buf, ranges)?;

        let mut hasher = Sha256::new();
        hasher.update(&buf[..contents_start]);
        hasher.update(&buf[contents_end..]);
        let digest = hasher.finalize();

        let container = self.build_cms(&digest)?;
        splice_contents(&mut buf, contents_start, &container)?;
        Ok(buf)
    }

    /// Detached SignedData over the document digest, carrying the signing
    /// certificate so standard validators can verify offline.
    fn build_cms(&self, digest: &[u8]) -> Result<Vec<u8>, RenderError> {
        let econtent = EncapsulatedContentInfo {
            econtent_type: const_oid::db::rfc5911::ID_DATA,
            econtent: None,
        };
        let digest_algorithm = AlgorithmIdentifierOwned {
            oid: const_oid::db::rfc5912::ID_SHA_256,
            parameters: None,
        };
        let sid = SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
            issuer: self.certificate.tbs_certificate.issuer.clone(),
            serial_number: self.certificate.tbs_certificate.serial_number.clone(),
        });

        let signing_key = SigningKey::<Sha256>::new(self.key.clone());
        let signer_info = SignerInfoBuilder::new(
            &signing_key,
            sid,
            digest_algorithm.clone(),
            &econtent,
            Some(digest),
        )
        .map_err(|e| RenderError::Signature(e.to_string()))?;

        let mut builder = SignedDataBuilder::new(&econtent);
        let content = builder
            .add_digest_algorithm(digest_algorithm)
            .map_err(|e| RenderError::Signature(e.to_string()))?
            .add_certificate(CertificateChoices::Certificate(self.certificate.clone()))
            .map_err(|e| RenderError::Signature(e.to_string()))?
            .add_signer_info::<SigningKey<Sha256>, rsa::pkcs1v15::Signature>(signer_info)
            .map_err(|e| RenderError::Signature(e.to_string()))?
            .build()
            .map_err(|e| RenderError::Signature(e.to_string()))?;

        content
            .to_der()
            .map_err(|e| RenderError::Signature(e.to_string()))
    }
}

/// Signature dictionary, invisible widget field, and AcroForm entry.
fn add_signature_objects(doc: &mut Document, info: &SignerInfo) -> Result<(), RenderError> {
    let pages = doc.get_pages();
    let (_, &page_id) = pages
        .iter()
        .next()
        .ok_or_else(|| RenderError::Signature("document has no pages".to_string()))?;

    let mut sig = Dictionary::new();
    sig.set("Type", Object::Name(b"Sig".to_vec()));
    sig.set("Filter", Object::Name(b"Adobe.PPKLite".to_vec()));
    sig.set("SubFilter", Object::Name(b"adbe.pkcs7.detached".to_vec()));
    sig.set(
        "ByteRange",
        Object::Array(vec![
            Object::Integer(0),
            Object::Integer(BYTE_RANGE_SENTINELS[0]),
            Object::Integer(BYTE_RANGE_SENTINELS[1]),
            Object::Integer(BYTE_RANGE_SENTINELS[2]),
        ]),
    );
    sig.set(
        "Contents",
        Object::String(vec![0u8; SIG_CONTENTS_LEN / 2], StringFormat::Hexadecimal),
    );
    sig.set("Name", Object::string_literal(info.name.clone()));
    sig.set("Location", Object::string_literal(info.location.clone()));
    sig.set("Reason", Object::string_literal(info.reason.clone()));
    sig.set("ContactInfo", Object::string_literal(info.contact.clone()));
    sig.set(
        "M",
        Object::string_literal(Utc::now().format("D:%Y%m%d%H%M%S+00'00'").to_string()),
    );
    let sig_ref = doc.add_object(sig);

    let mut field = Dictionary::new();
    field.set("Type", Object::Name(b"Annot".to_vec()));
    field.set("Subtype", Object::Name(b"Widget".to_vec()));
    field.set("FT", Object::Name(b"Sig".to_vec()));
    field.set("T", Object::string_literal("Signature1"));
    field.set(
        "Rect",
        Object::Array(vec![
            Object::Integer(0),
            Object::Integer(0),
            Object::Integer(0),
            Object::Integer(0),
        ]),
    );
    // Hidden + locked widget: no visible appearance anywhere.
    field.set("F", Object::Integer(132));
    field.set("P", Object::Reference(page_id));
    field.set("V", Object::Reference(sig_ref));
    let field_ref = doc.add_object(field);

    let page = doc
        .get_object_mut(page_id)
        .and_then(Object::as_dict_mut)
        .map_err(|e| RenderError::Signature(format!("page dictionary: {e}")))?;
    match page.get_mut(b"Annots") {
        Ok(Object::Array(annots)) => annots.push(Object::Reference(field_ref)),
        _ => page.set("Annots", Object::Array(vec![Object::Reference(field_ref)])),
    }

    let catalog_id = doc
        .trailer
        .get(b"Root")
        .and_then(Object::as_reference)
        .map_err(|e| RenderError::Signature(format!("document catalog: {e}")))?;
    let catalog = doc
        .get_object_mut(catalog_id)
        .and_then(Object::as_dict_mut)
        .map_err(|e| RenderError::Signature(format!("document catalog: {e}")))?;
    let mut acro_form = Dictionary::new();
    acro_form.set("Fields", Object::Array(vec![Object::Reference(field_ref)]));
    acro_form.set("SigFlags", Object::Integer(3));
    catalog.set("AcroForm", Object::Dictionary(acro_form));

    Ok(())
}

/// Offsets of the zero-filled /Contents hex string, delimiters included.
fn locate_contents(buf: &[u8]) -> Result<(usize, usize), RenderError> {
    let mut i = 0;
    while i + SIG_CONTENTS_LEN + 2 <= buf.len() {
        if buf[i] == b'<'
            && buf[i + SIG_CONTENTS_LEN + 1] == b'>'
            && buf[i + 1..i + 1 + SIG_CONTENTS_LEN].iter().all(|&b| b == b'0')
        {
            return Ok((i, i + SIG_CONTENTS_LEN + 2));
        }
        i += 1;
    }
    Err(RenderError::Signature(
        "signature contents placeholder not found".to_string(),
    ))
}

/// Rewrite the sentinel /ByteRange array in place, space-padded to keep every
/// byte offset in the file stable.
fn patch_byte_range(buf: &mut [u8], ranges: [i64; 4]) -> Result<(), RenderError> {
    // Anchor on the dictionary key; the sentinel digits alone could collide
    // with bytes inside a compressed stream.
    let key = find(buf, b"/ByteRange")
        .ok_or_else(|| RenderError::Signature("byte range placeholder not found".to_string()))?;
    let marker = BYTE_RANGE_SENTINELS[0].to_string();
    let pos = key
        + find(&buf[key..], marker.as_bytes())
            .ok_or_else(|| RenderError::Signature("byte range placeholder not found".to_string()))?;
    let open = buf[..pos]
        .iter()
        .rposition(|&b| b == b'[')
        .ok_or_else(|| RenderError::Signature("byte range array malformed".to_string()))?;
    let close = pos
        + buf[pos..]
            .iter()
            .position(|&b| b == b']')
            .ok_or_else(|| RenderError::Signature("byte range array malformed".to_string()))?;

    let slot = close - open + 1;
    let body = format!("{} {} {} {}", ranges[0], ranges[1], ranges[2], ranges[3]);
    if body.len() + 2 > slot {
        return Err(RenderError::Signature(
            "byte range does not fit its placeholder".to_string(),
        ));
    }
    let mut patch = Vec::with_capacity(slot);
    patch.push(b'[');
    patch.extend_from_slice(body.as_bytes());
    patch.resize(slot - 1, b' ');
    patch.push(b']');
    buf[open..=close].copy_from_slice(&patch);
    Ok(())
}

/// Hex-encode the CMS container into the placeholder; the unused tail keeps
/// its zero padding.
fn splice_contents(
    buf: &mut [u8],
    contents_start: usize,
    container: &[u8],
) -> Result<(), RenderError> {
    if container.len() * 2 > SIG_CONTENTS_LEN {
        return Err(RenderError::Signature(format!(
            "signature container of {} bytes exceeds the reserved space",
            container.len()
        )));
    }
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut offset = contents_start + 1;
    for &byte in container {
        buf[offset] = HEX[(byte >> 4) as usize];
        buf[offset + 1] = HEX[(byte & 0x0f) as usize];
        offset += 2;
    }
    Ok(())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
