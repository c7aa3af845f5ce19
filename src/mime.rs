//! MIME encoding of evaluation results and display payloads.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::protocol::{
    IMAGE_JPEG, IMAGE_PNG, IMAGE_SVG, MimeBundle, TEXT_HTML, TEXT_PLAIN,
};
use crate::value::{ValueKind, ValueRef};

/// User-installed encoder. When present it replaces the default rules
/// entirely.
pub type Mimer = Arc<dyn Fn(&ValueRef) -> MimeBundle + Send + Sync>;

/// Encodes a value into a MIME bundle, honoring a user-installed mimer.
pub fn encode(value: &ValueRef, mimer: Option<&Mimer>) -> MimeBundle {
    match mimer {
        Some(mimer) => mimer(value),
        None => default_encode(value),
    }
}

/// Default encoding rules, applied in order and merged into the bundle:
/// `undefined`/`null` literals; the value's own `to_mime` seed; `text/plain`
/// from the canonical inspect; `to_html`/`to_svg`/`to_png`/`to_jpeg` for the
/// content types still absent.
pub fn default_encode(value: &ValueRef) -> MimeBundle {
    let mut bundle = MimeBundle::new();
    match value.kind() {
        ValueKind::Undefined => {
            bundle.insert(TEXT_PLAIN.to_string(), "undefined".to_string());
            return bundle;
        }
        ValueKind::Null => {
            bundle.insert(TEXT_PLAIN.to_string(), "null".to_string());
            return bundle;
        }
        _ => {}
    }

    if let Some(seed) = value.to_mime() {
        bundle = seed;
    }
    if !bundle.contains_key(TEXT_PLAIN) {
        bundle.insert(TEXT_PLAIN.to_string(), value.display());
    }
    if !bundle.contains_key(TEXT_HTML) {
        if let Some(html) = value.to_html() {
            bundle.insert(TEXT_HTML.to_string(), html);
        }
    }
    if !bundle.contains_key(IMAGE_SVG) {
        if let Some(svg) = value.to_svg() {
            bundle.insert(IMAGE_SVG.to_string(), svg);
        }
    }
    if !bundle.contains_key(IMAGE_PNG) {
        if let Some(png) = value.to_png() {
            bundle.insert(IMAGE_PNG.to_string(), STANDARD.encode(png));
        }
    }
    if !bundle.contains_key(IMAGE_JPEG) {
        if let Some(jpeg) = value.to_jpeg() {
            bundle.insert(IMAGE_JPEG.to_string(), STANDARD.encode(jpeg));
        }
    }
    bundle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    struct Plain(ValueKind, &'static str);

    impl Value for Plain {
        fn kind(&self) -> ValueKind {
            self.0
        }
        fn display(&self) -> String {
            self.1.to_string()
        }
    }

    struct Rich;

    impl Value for Rich {
        fn kind(&self) -> ValueKind {
            ValueKind::Object
        }
        fn display(&self) -> String {
            "{ rich: true }".to_string()
        }
        fn to_mime(&self) -> Option<MimeBundle> {
            let mut bundle = MimeBundle::new();
            bundle.insert(TEXT_HTML.to_string(), "<b>rich</b>".to_string());
            Some(bundle)
        }
        fn to_html(&self) -> Option<String> {
            Some("<i>ignored</i>".to_string())
        }
        fn to_png(&self) -> Option<Vec<u8>> {
            Some(vec![0x89, 0x50, 0x4e, 0x47])
        }
    }

    fn value(v: impl Value + 'static) -> ValueRef {
        Arc::new(v)
    }

    #[test]
    fn undefined_and_null_use_their_literals() {
        let undefined = default_encode(&value(Plain(ValueKind::Undefined, "undefined")));
        assert_eq!(undefined.get(TEXT_PLAIN).map(String::as_str), Some("undefined"));

        let null = default_encode(&value(Plain(ValueKind::Null, "null")));
        assert_eq!(null.get(TEXT_PLAIN).map(String::as_str), Some("null"));
    }

    #[test]
    fn text_plain_falls_back_to_canonical_inspect() {
        let bundle = default_encode(&value(Plain(ValueKind::Str, "'hi'")));
        assert_eq!(bundle.get(TEXT_PLAIN).map(String::as_str), Some("'hi'"));
    }

    #[test]
    fn to_mime_seeds_and_existing_entries_win() {
        let bundle = default_encode(&value(Rich));
        // The seed's text/html survives; to_html does not overwrite it.
        assert_eq!(bundle.get(TEXT_HTML).map(String::as_str), Some("<b>rich</b>"));
        // text/plain is filled from the canonical inspect.
        assert_eq!(
            bundle.get(TEXT_PLAIN).map(String::as_str),
            Some("{ rich: true }")
        );
        // Binary payloads are base64 strings.
        assert_eq!(bundle.get(IMAGE_PNG).map(String::as_str), Some("iVBORw=="));
    }

    #[test]
    fn installed_mimer_replaces_the_default_entirely() {
        let mimer: Mimer = Arc::new(|_value| {
            let mut bundle = MimeBundle::new();
            bundle.insert(TEXT_PLAIN.to_string(), "custom".to_string());
            bundle
        });
        let bundle = encode(&value(Rich), Some(&mimer));
        assert_eq!(bundle.len(), 1);
        assert_eq!(bundle.get(TEXT_PLAIN).map(String::as_str), Some("custom"));
    }
}
