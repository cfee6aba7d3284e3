//! Image-embed classification.
//!
//! A post belongs in a Lightbox feed when it carries at least one image,
//! either directly (`app.bsky.embed.images`) or alongside a quoted record
//! (`app.bsky.embed.recordWithMedia` whose media is an images embed).
//! Everything else, including embeds we fail to parse, is [`Embed::Other`].

use serde::Deserialize;
use serde_json::Value;

/// The subset of post embeds the classifier distinguishes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "$type")]
pub enum Embed {
    #[serde(rename = "app.bsky.embed.images")]
    Images(ImagesEmbed),
    #[serde(rename = "app.bsky.embed.recordWithMedia")]
    RecordWithMedia(RecordWithMediaEmbed),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ImagesEmbed {
    #[serde(default)]
    pub images: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RecordWithMediaEmbed {
    pub media: Box<Embed>,
}

impl Embed {
    /// Interpret an `embed` JSON object, falling back to [`Embed::Other`].
    pub fn from_value(value: &Value) -> Self {
        Self::deserialize(value).unwrap_or(Self::Other)
    }

    fn is_nonempty_images(&self) -> bool {
        matches!(self, Self::Images(images) if !images.images.is_empty())
    }
}

/// True when the embed carries at least one image.
pub fn has_qualifying_embed(embed: &Embed) -> bool {
    match embed {
        Embed::Images(_) => embed.is_nonempty_images(),
        Embed::RecordWithMedia(rwm) => rwm.media.is_nonempty_images(),
        Embed::Other => false,
    }
}

/// Apply [`has_qualifying_embed`] to a whole post record.
///
/// A record without an `embed` field never qualifies.
pub fn record_has_qualifying_embed(record: &Value) -> bool {
    record
        .get("embed")
        .map(Embed::from_value)
        .is_some_and(|embed| has_qualifying_embed(&embed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn image() -> Value {
        json!({
            "alt": "a cat",
            "image": {"$type": "blob", "ref": {"$link": "bafy"}, "mimeType": "image/jpeg", "size": 1}
        })
    }

    fn post_with(embed: Value) -> Value {
        json!({"$type": "app.bsky.feed.post", "text": "hi", "createdAt": "2024-05-01T00:00:00Z", "embed": embed})
    }

    #[test]
    fn test_images_embed_qualifies() {
        let record = post_with(json!({"$type": "app.bsky.embed.images", "images": [image()]}));
        assert!(record_has_qualifying_embed(&record));
    }

    #[test]
    fn test_empty_images_embed_does_not_qualify() {
        let record = post_with(json!({"$type": "app.bsky.embed.images", "images": []}));
        assert!(!record_has_qualifying_embed(&record));

        let record = post_with(json!({"$type": "app.bsky.embed.images"}));
        assert!(!record_has_qualifying_embed(&record));
    }

    #[test]
    fn test_record_with_image_media_qualifies() {
        let record = post_with(json!({
            "$type": "app.bsky.embed.recordWithMedia",
            "record": {"$type": "app.bsky.embed.record", "record": {"uri": "at://x/app.bsky.feed.post/1", "cid": "c"}},
            "media": {"$type": "app.bsky.embed.images", "images": [image()]}
        }));
        assert!(record_has_qualifying_embed(&record));
    }

    #[test]
    fn test_record_with_video_media_does_not_qualify() {
        let record = post_with(json!({
            "$type": "app.bsky.embed.recordWithMedia",
            "record": {"$type": "app.bsky.embed.record", "record": {"uri": "at://x/app.bsky.feed.post/1", "cid": "c"}},
            "media": {"$type": "app.bsky.embed.video", "video": {}}
        }));
        assert!(!record_has_qualifying_embed(&record));
    }

    #[test]
    fn test_other_embeds_do_not_qualify() {
        for embed in [
            json!({"$type": "app.bsky.embed.external", "external": {"uri": "https://example.com"}}),
            json!({"$type": "app.bsky.embed.record", "record": {"uri": "at://x/app.bsky.feed.post/1"}}),
            json!({"$type": "app.bsky.embed.video", "video": {}}),
            json!({"images": [image()]}),
            json!("not an object"),
        ] {
            assert!(!record_has_qualifying_embed(&post_with(embed.clone())), "{embed}");
        }
    }

    #[test]
    fn test_missing_embed_does_not_qualify() {
        assert!(!record_has_qualifying_embed(&json!({"text": "plain"})));
    }

    #[test]
    fn test_malformed_record_with_media_is_other() {
        let embed = Embed::from_value(&json!({"$type": "app.bsky.embed.recordWithMedia"}));
        assert_eq!(embed, Embed::Other);
        assert!(!has_qualifying_embed(&embed));
    }
}
