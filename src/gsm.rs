//! GSM 03.38 default-alphabet transliteration.
//!
//! The MT pipeline encodes `coding=0` content into the GSM 7-bit default
//! alphabet: each character becomes its index in the default table, extension
//! characters become `ESC (0x1B)` followed by their index in the extension
//! table, and anything in neither table is dropped.

/// The 128-entry GSM 03.38 default alphabet, indexed by septet value.
const GSM_DEFAULT: [char; 128] = [
    '@', '£', '$', '¥', 'è', 'é', 'ù', 'ì', 'ò', 'Ç', '\n', 'Ø', 'ø', '\r', 'Å', 'å', //
    'Δ', '_', 'Φ', 'Γ', 'Λ', 'Ω', 'Π', 'Ψ', 'Σ', 'Θ', 'Ξ', '\u{1b}', 'Æ', 'æ', 'ß', 'É', //
    ' ', '!', '"', '#', '¤', '%', '&', '\'', '(', ')', '*', '+', ',', '-', '.', '/', //
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', ':', ';', '<', '=', '>', '?', //
    '¡', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', //
    'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'Ä', 'Ö', 'Ñ', 'Ü', '§', //
    '¿', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', //
    'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'ä', 'ö', 'ñ', 'ü', 'à',
];

const ESC: char = '\u{1b}';

/// Extension-table characters and their septet values (03.38 Table 6.2.1.1).
const GSM_EXTENSION: [(char, u8); 9] = [
    ('^', 0x14),
    ('{', 0x28),
    ('}', 0x29),
    ('\\', 0x2F),
    ('[', 0x3C),
    ('~', 0x3D),
    (']', 0x3E),
    ('|', 0x40),
    ('€', 0x65),
];

/// Transliterate text to GSM 03.38 septet values, one per output char.
///
/// The result is a string of chars in `0..=127` ready to be carried as
/// `short_message` octets. Characters outside both alphabets are dropped.
pub fn gsm_encode(plaintext: &str) -> String {
    let mut out = String::with_capacity(plaintext.len());

    for c in plaintext.chars() {
        if let Some(idx) = GSM_DEFAULT.iter().position(|&g| g == c) {
            out.push(idx as u8 as char);
        } else if let Some(&(_, idx)) = GSM_EXTENSION.iter().find(|&&(g, _)| g == c) {
            out.push(ESC);
            out.push(idx as char);
        }
        // not representable: dropped
    }

    out
}
