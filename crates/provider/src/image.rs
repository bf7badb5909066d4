//! Operating system image lookup

use tracing::debug;

use metal_common::{Error, Image, ImageQuery, Result};

use crate::client::ImageCatalog;

/// Resolve an operating system image by slug
pub async fn read_image(catalog: &dyn ImageCatalog, query: &ImageQuery) -> Result<Image> {
    let slug = query
        .slug
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::validation("slug", "slug must be assigned"))?;

    debug!("Looking up image {}", slug);
    catalog.get_image(slug).await
}
