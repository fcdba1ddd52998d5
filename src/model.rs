use serde::Serialize;

/// CSV column order. Consumers of the export rely on this exact sequence.
pub const COLUMNS: [&str; 12] = [
    "id",
    "titulo",
    "ubicacion",
    "descripcion",
    "link",
    "precio",
    "moneda",
    "area",
    "habitaciones",
    "banos",
    "operacion",
    "propiedad",
];

/// One listing tile, flattened.
///
/// Field order matches [`COLUMNS`]; the CSV writer derives its header from it.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Listing {
    /// 1-based, assigned by the pager in emission order. Zero until then.
    pub id: u64,
    pub titulo: String,
    pub ubicacion: String,
    pub descripcion: String,
    pub link: String,
    pub precio: String,
    pub moneda: Currency,
    pub area: String,
    pub habitaciones: String,
    pub banos: String,
    pub operacion: Operation,
    pub propiedad: String,
}

#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Currency {
    #[serde(rename = "USD")]
    Usd,
    #[serde(rename = "CRC")]
    Crc,
    #[serde(rename = "EUR")]
    Eur,
    #[default]
    #[serde(rename = "")]
    Unknown,
}

#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Alquiler,
    Venta,
    #[default]
    #[serde(rename = "")]
    Unknown,
}
