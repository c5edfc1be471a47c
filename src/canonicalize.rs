//! Canonical forms used for signing, hashing, and equivalence checks.
//!
//! Two distinct notions of "canonical" appear in the core: a general
//! string-normalization step that closes the semantic-gap attacks free text
//! is prone to (null bytes, alternate Unicode encodings, stray whitespace),
//! and the structured, field-ordered signable form every signed artifact
//! commits to (§4.2, §6).

use unicode_normalization::UnicodeNormalization;

/// A normalized string paired with the input it was derived from, kept for
/// audit purposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalString {
    pub canonical_form: String,
    pub original: String,
}

/// Normalize a free-text string: strip null bytes, NFC-normalize, trim.
pub fn canonicalize_string(raw: &str) -> CanonicalString {
    let sanitized = raw.replace('\0', "");
    let normalized: String = sanitized.nfc().collect();
    let trimmed = normalized.trim().to_string();
    CanonicalString {
        canonical_form: trimmed,
        original: raw.to_string(),
    }
}

/// True if two strings normalize to the same canonical form.
pub fn are_equivalent(a: &str, b: &str) -> bool {
    canonicalize_string(a).canonical_form == canonicalize_string(b).canonical_form
}

/// Join already-normalized fields into the pipe-delimited signable form
/// described in §6: "fields concatenated with the pipe delimiter in the
/// order declared". Callers supply fields pre-sorted/pre-formatted (decimals
/// in plain form, sets sorted, timestamps as ISO-8601 UTC) since the
/// ordering rules differ per artifact.
pub fn canonical_form(fields: &[&str]) -> String {
    fields.join("|")
}

/// Sort and join a set of strings with commas, for embedding a set-valued
/// field into a canonical form without ambiguity over member order.
pub fn canonical_set(values: impl IntoIterator<Item = impl Into<String>>) -> String {
    let mut values: Vec<String> = values.into_iter().map(Into::into).collect();
    values.sort();
    values.join(",")
}
