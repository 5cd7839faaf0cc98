pub mod client;

pub use client::ShopifyClient;

const SHOP_SUFFIX: &str = ".myshopify.com";

/// `my-store` and `https://my-store.myshopify.com/` both become
/// `my-store.myshopify.com`.
pub fn normalize_shop_domain(shop: &str) -> String {
    let trimmed = shop
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_ascii_lowercase();
    if trimmed.ends_with(SHOP_SUFFIX) {
        trimmed
    } else {
        format!("{trimmed}{SHOP_SUFFIX}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shop_domains_are_normalized() {
        assert_eq!(normalize_shop_domain("my-store"), "my-store.myshopify.com");
        assert_eq!(
            normalize_shop_domain("https://My-Store.myshopify.com/"),
            "my-store.myshopify.com"
        );
    }
}
