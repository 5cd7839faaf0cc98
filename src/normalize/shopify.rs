use super::{
    CanonicalReview, NormalizeContext, first_bool, first_f64, first_string, first_u64,
    normalize_date,
};
use serde_json::{Map, Value};

const DEFAULT_LANGUAGE: &str = "en";
const ANONYMOUS: &str = "Anonymous";

/// The review itself lives in the metafield `value`, either as a JSON object,
/// a JSON string holding one, or plain text taken as the body.
fn review_fields(metafield: &Map<String, Value>) -> Map<String, Value> {
    match metafield.get("value") {
        Some(Value::Object(fields)) => fields.clone(),
        Some(Value::String(text)) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(fields)) => fields,
            _ => {
                let mut fields = Map::new();
                fields.insert("body".into(), Value::String(text.clone()));
                fields
            }
        },
        _ => Map::new(),
    }
}

pub fn normalize(raw: &Value, context: &NormalizeContext<'_>) -> Option<CanonicalReview> {
    let metafield = raw.as_object()?;
    let fields = review_fields(metafield);
    let review_id = first_string(&fields, &["id", "review_id", "reviewId"])
        .or_else(|| first_string(metafield, &["id"]))?;

    Some(CanonicalReview {
        review_id,
        reviewer_id: first_string(&fields, &["reviewer_id", "customer_id", "reviewerId"])
            .unwrap_or_default(),
        display_name: first_string(&fields, &["author_name", "name", "displayName"])
            .unwrap_or_else(|| ANONYMOUS.to_string()),
        rating: first_f64(&fields, &["rating", "stars", "score"]).unwrap_or(0.0),
        title: first_string(&fields, &["title", "headline"]).unwrap_or_default(),
        body: first_string(&fields, &["body", "text", "content"]).unwrap_or_default(),
        verified_purchase: first_bool(&fields, &["verified_purchase", "verified", "verifiedPurchase"])
            .unwrap_or(false),
        helpful_votes: first_u64(&fields, &["helpful_votes", "upvotes", "helpfulVotes"])
            .unwrap_or(0),
        language: first_string(&fields, &["language"])
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
        review_date: normalize_date(
            first_string(&fields, &["date", "created_at", "reviewDate"])
                .or_else(|| first_string(metafield, &["created_at"])),
        ),
        platform: context.platform,
        source_item_id: first_string(&fields, &["product_id", "sourceItemId"])
            .or_else(|| first_string(metafield, &["owner_id"]))
            .unwrap_or_else(|| context.item_id.to_string()),
        marketplace_id: context.marketplace_id.to_string(),
        source_page_token: context.page_token.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Platform;
    use serde_json::json;

    fn context() -> NormalizeContext<'static> {
        NormalizeContext {
            platform: Platform::Shopify,
            item_id: "8123",
            marketplace_id: "demo.myshopify.com",
            page_token: "page2",
        }
    }

    #[test]
    fn json_string_value_is_unpacked() {
        let raw = json!({
            "id": 991,
            "owner_id": 8123,
            "created_at": "2025-04-01T09:00:00-04:00",
            "value": "{\"review_id\":\"rv-1\",\"name\":\"Ana\",\"score\":\"3\",\"verified\":true,\"upvotes\":2}"
        });
        let review = normalize(&raw, &context()).unwrap();
        assert_eq!(review.review_id, "rv-1");
        assert_eq!(review.display_name, "Ana");
        assert_eq!(review.rating, 3.0);
        assert!(review.verified_purchase);
        assert_eq!(review.helpful_votes, 2);
        assert_eq!(review.language, "en");
        assert_eq!(review.review_date, "2025-04-01T13:00:00Z");
        assert_eq!(review.source_item_id, "8123");
    }

    #[test]
    fn plain_text_value_becomes_body_and_metafield_id_is_used() {
        let raw = json!({"id": 42, "value": "Nice mug"});
        let review = normalize(&raw, &context()).unwrap();
        assert_eq!(review.review_id, "42");
        assert_eq!(review.body, "Nice mug");
        assert_eq!(review.display_name, "Anonymous");
        assert_eq!(review.review_date, "");
    }

    #[test]
    fn renormalizing_canonical_output_is_stable() {
        let raw = json!({
            "id": 991,
            "owner_id": 8123,
            "value": {
                "review_id": "rv-7",
                "customer_id": "c-12",
                "author_name": "Lee",
                "rating": 4,
                "title": "Sturdy",
                "body": "Holds heat well",
                "verified_purchase": true,
                "helpful_votes": 3,
                "language": "fr",
                "date": "2025-03-09T18:45:00+02:00"
            }
        });
        let once = normalize(&raw, &context()).unwrap();
        let remapped = json!({"id": 991, "value": serde_json::to_value(&once).unwrap()});
        assert_eq!(normalize(&remapped, &context()).unwrap(), once);
    }

    #[test]
    fn renormalizing_through_a_json_string_value_is_stable() {
        let raw = json!({
            "id": 991,
            "owner_id": 8123,
            "created_at": "2025-04-01T09:00:00-04:00",
            "value": "{\"review_id\":\"rv-1\",\"name\":\"Ana\",\"score\":\"3\",\"verified\":true,\"upvotes\":2}"
        });
        let once = normalize(&raw, &context()).unwrap();
        let remapped = json!({
            "id": 991,
            "value": serde_json::to_string(&once).unwrap()
        });
        let again = normalize(&remapped, &context()).unwrap();
        assert_eq!(again, once);
        assert_eq!(again.review_id, "rv-1");
        assert_eq!(again.review_date, "2025-04-01T13:00:00Z");
    }

    #[test]
    fn object_value_without_any_id_is_dropped() {
        let raw = json!({"value": {"body": "orphan"}});
        assert!(normalize(&raw, &context()).is_none());
    }
}
