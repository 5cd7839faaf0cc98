use super::{
    CanonicalReview, NormalizeContext, first_bool, first_f64, first_string, first_u64,
    normalize_date,
};
use serde_json::Value;

const DEFAULT_LANGUAGE: &str = "en-US";

/// Maps one SP-API review record onto the canonical schema.
pub fn normalize(raw: &Value, context: &NormalizeContext<'_>) -> Option<CanonicalReview> {
    let record = raw.as_object()?;
    let review_id = first_string(record, &["reviewId", "id"])?;

    Some(CanonicalReview {
        review_id,
        reviewer_id: first_string(record, &["reviewerId"]).unwrap_or_default(),
        display_name: first_string(record, &["reviewerName", "displayName"]).unwrap_or_default(),
        rating: first_f64(record, &["rating", "stars"]).unwrap_or(0.0),
        title: first_string(record, &["title", "headline"]).unwrap_or_default(),
        body: first_string(record, &["body", "text", "content"]).unwrap_or_default(),
        verified_purchase: first_bool(record, &["verifiedPurchase"]).unwrap_or(false),
        helpful_votes: first_u64(record, &["helpfulVotes"]).unwrap_or(0),
        language: first_string(record, &["language"])
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
        review_date: normalize_date(first_string(record, &["reviewDate", "date"])),
        platform: context.platform,
        source_item_id: context.item_id.to_string(),
        marketplace_id: context.marketplace_id.to_string(),
        source_page_token: context.page_token.to_string(),
    })
}
