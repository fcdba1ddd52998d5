use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::extract;
use crate::model::Listing;

#[allow(clippy::expect_used)]
static CONTAINER: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("#currentlistings").expect("valid selector"));
#[allow(clippy::expect_used)]
static TILE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("[data-tracklisting].d3-ad-tile").expect("valid selector"));
#[allow(clippy::expect_used)]
static AJAX_HINT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("[data-ajax-url]").expect("valid selector"));

/// How strictly to look for tiles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    /// Full page: tiles only count inside the listings container.
    Page,
    /// Listings fragment: use the container if present, else the whole body.
    Fragment,
}

/// Owned result of parsing one document.
#[derive(Clone, Debug, Default)]
pub struct PageScan {
    pub container_found: bool,
    /// Tile markers seen, including skipped ones. Drives the page-size check.
    pub tile_count: usize,
    pub listings: Vec<Listing>,
    pub skipped: usize,
    /// `data-ajax-url` found anywhere on the page.
    pub ajax_template: Option<String>,
}

/// Tiles of the listings container in document order, or `None` when the
/// container is missing.
pub fn extract_tiles(doc: &Html) -> Option<Vec<ElementRef<'_>>> {
    let container = doc.select(&CONTAINER).next()?;
    Some(container.select(&TILE).collect())
}

pub fn extract_tiles_loose(doc: &Html) -> Vec<ElementRef<'_>> {
    extract_tiles(doc).unwrap_or_else(|| doc.select(&TILE).collect())
}

pub fn scan_page(html: &str, scope: Scope) -> PageScan {
    let doc = Html::parse_document(html);
    let container_found = doc.select(&CONTAINER).next().is_some();
    let tiles = match scope {
        Scope::Page => extract_tiles(&doc).unwrap_or_default(),
        Scope::Fragment => extract_tiles_loose(&doc),
    };

    let mut listings = Vec::with_capacity(tiles.len());
    let mut skipped = 0usize;
    for (i, tile) in tiles.iter().enumerate() {
        match extract::extract(tile) {
            Ok(l) => listings.push(l),
            Err(e) => {
                debug!(tile = i, "skipping tile: {e}");
                skipped += 1;
            }
        }
    }

    let ajax_template = doc
        .select(&AJAX_HINT)
        .find_map(|e| e.value().attr("data-ajax-url"))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    PageScan {
        container_found,
        tile_count: tiles.len(),
        listings,
        skipped,
        ajax_template,
    }
}
