use crate::error::ExportError;
use crate::model::Listing;

/// Serialize listings as CSV with a header row in [`crate::model::COLUMNS`]
/// order.
pub fn to_csv(listings: &[Listing]) -> Result<String, ExportError> {
    let mut writer = csv::Writer::from_writer(vec![]);
    if listings.is_empty() {
        writer.write_record(crate::model::COLUMNS)?;
    }
    for l in listings {
        writer.serialize(l)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| ExportError::Buffer(e.to_string()))?;
    Ok(String::from_utf8(bytes)?)
}

pub fn file_name(user_id: u64) -> String {
    format!("enc24_{user_id}.csv")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{COLUMNS, Currency, Operation};

    #[test]
    fn header_matches_column_order() {
        let out = to_csv(&[Listing::default()]).unwrap();
        let header = out.lines().next().unwrap();
        assert_eq!(header, COLUMNS.join(","));

        let empty = to_csv(&[]).unwrap();
        assert_eq!(empty.trim_end(), COLUMNS.join(","));
    }

    #[test]
    fn rows_quote_free_text() {
        let l = Listing {
            id: 1,
            titulo: "Casa, con \"vista\"".into(),
            link: "https://www.encuentra24.com/x".into(),
            precio: "150,000".into(),
            moneda: Currency::Usd,
            operacion: Operation::Venta,
            propiedad: "casa".into(),
            ..Listing::default()
        };
        let out = to_csv(&[l]).unwrap();
        let row = out.lines().nth(1).unwrap();
        assert_eq!(
            row,
            r#"1,"Casa, con ""vista""",,,https://www.encuentra24.com/x,"150,000",USD,,,,venta,casa"#
        );
    }
}
