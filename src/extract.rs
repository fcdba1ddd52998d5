//! Tile → [`Listing`].
//!
//! Every sub-element is optional; a missing one leaves its field empty.
//! Only a tile with nothing recognizable in it is rejected.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Selector};
use url::Url;

use crate::config::BASE_URL;
use crate::model::{Currency, Listing, Operation};

#[allow(clippy::expect_used)]
fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("valid selector")
}

static TITLE: LazyLock<Selector> = LazyLock::new(|| selector("span.d3-ad-tile__title"));
static LOCATION: LazyLock<Selector> =
    LazyLock::new(|| selector("div.d3-ad-tile__location > span"));
static DESCRIPTION: LazyLock<Selector> =
    LazyLock::new(|| selector("div.d3-ad-tile__short-description"));
static DESCRIPTION_LINK: LazyLock<Selector> =
    LazyLock::new(|| selector("a.d3-ad-tile__description[href]"));
static COVER_LINK: LazyLock<Selector> =
    LazyLock::new(|| selector("div.d3-ad-tile__cover a[href]"));
static PRICE: LazyLock<Selector> = LazyLock::new(|| selector("div.d3-ad-tile__price"));
static DETAILS: LazyLock<Selector> =
    LazyLock::new(|| selector("ul.d3-ad-tile__details > li"));

#[allow(clippy::expect_used)]
static PRICE_DIGITS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9.,]*[0-9][0-9.,]*").expect("valid regex"));
#[allow(clippy::expect_used)]
static LEADING_INT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[0-9]+").expect("valid regex"));

/// Markers per currency, in the order they are tried. First hit wins.
const CURRENCY_MARKERS: &[(Currency, &[&str])] = &[
    (Currency::Usd, &["$", "usd", "us$"]),
    (Currency::Crc, &["₡", "crc", "colones"]),
    (Currency::Eur, &["€", "eur"]),
];

const CATEGORY_PREFIX: &str = "bienes-raices-";

const STOP_WORDS: &[&str] = &[
    "de",
    "propiedades",
    "amueblados",
    "amueblado",
    "lujo",
    "linea",
    "blanca",
    "moderno",
    "nuevo",
    "nueva",
    "remodelado",
    "remodelada",
];

const CATEGORIES: &[(&str, &str)] = &[
    ("apartamentos", "apartamento"),
    ("apartamento", "apartamento"),
    ("casas", "casa"),
    ("casa", "casa"),
    ("cuartos", "cuarto"),
    ("cuarto", "cuarto"),
    ("oficinas", "oficina"),
    ("oficina", "oficina"),
    ("locales", "local"),
    ("local", "local"),
    ("lotes", "lote"),
    ("lote", "lote"),
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TileError {
    #[error("tile has no title, link or price")]
    Empty,
}

/// Extract one listing. `id` is left at zero for the pager to assign.
pub fn extract(tile: &ElementRef<'_>) -> Result<Listing, TileError> {
    let titulo = tile
        .select(&TITLE)
        .map(|t| {
            t.children()
                .filter_map(|c| c.value().as_text().map(|s| &**s))
                .collect::<String>()
        })
        .collect::<String>();
    let titulo = norm_space(&titulo);

    let ubicacion = first_text(tile, &LOCATION);
    let descripcion = first_text(tile, &DESCRIPTION);

    let href = tile
        .select(&DESCRIPTION_LINK)
        .chain(tile.select(&COVER_LINK))
        .find_map(|a| a.value().attr("href"))
        .map(str::trim)
        .filter(|h| !h.is_empty());
    let link = href.map(|h| resolve_link(BASE_URL, h)).unwrap_or_default();

    let raw_price = first_text(tile, &PRICE);

    if titulo.is_empty() && link.is_empty() && raw_price.is_empty() {
        return Err(TileError::Empty);
    }

    let details: Vec<String> = tile.select(&DETAILS).map(|li| element_text(&li)).collect();
    let area = details.first().map(|d| clean_area(d)).unwrap_or_default();
    let habitaciones = details.get(1).cloned().unwrap_or_default();
    // Always the last item, even when that is also the rooms item.
    let banos = details.last().cloned().unwrap_or_default();

    let (operacion, propiedad) = classify(&link);

    Ok(Listing {
        id: 0,
        titulo,
        ubicacion,
        descripcion,
        precio: clean_price(&raw_price),
        moneda: detect_currency(&raw_price),
        link,
        area,
        habitaciones,
        banos,
        operacion,
        propiedad,
    })
}

/// Collapse every whitespace run to one space and trim.
pub fn norm_space(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(el: &ElementRef<'_>) -> String {
    norm_space(&el.text().collect::<String>())
}

fn first_text(tile: &ElementRef<'_>, sel: &Selector) -> String {
    tile.select(sel)
        .next()
        .map(|e| element_text(&e))
        .unwrap_or_default()
}

pub fn detect_currency(raw: &str) -> Currency {
    let t = raw.to_lowercase();
    CURRENCY_MARKERS
        .iter()
        .find(|(_, markers)| markers.iter().any(|m| t.contains(m)))
        .map(|(c, _)| *c)
        .unwrap_or_default()
}

/// First run of digits and separators, as written. Empty without digits.
pub fn clean_price(raw: &str) -> String {
    PRICE_DIGITS
        .find(raw)
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

pub fn clean_area(raw: &str) -> String {
    let no_commas = raw.replace(',', "");
    LEADING_INT
        .find(&no_commas)
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

/// Resolve `href` against `base`. Unparseable input is returned untouched.
pub fn resolve_link(base: &str, href: &str) -> String {
    match Url::parse(base).and_then(|b| b.join(href)) {
        Ok(u) => u.to_string(),
        Err(_) => href.to_string(),
    }
}

/// Operation and property category from the listing URL's second path
/// segment, e.g. `/costa-rica-es/bienes-raices-venta-casas/...`.
pub fn classify(link: &str) -> (Operation, String) {
    let path = match Url::parse(link) {
        Ok(u) => u.path().to_string(),
        Err(_) => link.to_string(),
    };
    let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
    match parts.get(1) {
        Some(segment) if segment.starts_with(CATEGORY_PREFIX) => classify_segment(segment),
        _ => (Operation::Unknown, String::new()),
    }
}

pub fn classify_segment(segment: &str) -> (Operation, String) {
    let operation = if segment.contains("alquiler") {
        Operation::Alquiler
    } else if segment.contains("venta") {
        Operation::Venta
    } else {
        Operation::Unknown
    };

    let rest = segment
        .replace(CATEGORY_PREFIX, "")
        .replace("alquiler-", "")
        .replace("venta-", "");
    let base = rest
        .split('-')
        .find(|w| !w.is_empty() && !STOP_WORDS.contains(w))
        .unwrap_or("");
    let category = CATEGORIES
        .iter()
        .find(|(k, _)| *k == base)
        .map_or(base, |(_, v)| *v);

    (operation, category.to_string())
}
