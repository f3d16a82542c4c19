use chardetng::EncodingDetector;
use encoding_rs::Encoding;

/// Decodes a response body to UTF-8.
///
/// Order: byte-order mark, then the Content-Type charset, then a chardetng
/// guess. Malformed sequences are replaced, not rejected.
pub fn decode_body(bytes: &[u8], content_type: Option<&str>) -> (String, &'static str) {
    if let Some((encoding, _)) = Encoding::for_bom(bytes) {
        return decode_with(bytes, encoding);
    }

    if let Some(encoding) = content_type
        .and_then(charset_label)
        .and_then(|label| Encoding::for_label(label.as_bytes()))
    {
        return decode_with(bytes, encoding);
    }

    let mut detector = EncodingDetector::new();
    detector.feed(bytes, true);
    decode_with(bytes, detector.guess(None, true))
}

fn charset_label(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|part| {
        let (key, value) = part.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches(['"', '\'']).to_string())
    })
}

fn decode_with(bytes: &[u8], encoding: &'static Encoding) -> (String, &'static str) {
    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        portal_logging::portal_debug!(
            "body had malformed {} sequences; replaced",
            encoding.name()
        );
    }
    (text.into_owned(), encoding.name())
}
