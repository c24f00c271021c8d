//! Quote-aware CSV decoding into [`RawRow`]s.

use tpsync_core::RawRow;

use crate::TransformError;

/// Split CSV text into records of fields.
///
/// Handles quoted fields with embedded commas, doubled quotes and line
/// breaks, CRLF line endings and a leading UTF-8 BOM. Blank lines are skipped.
pub fn split_records(text: &str) -> Result<Vec<Vec<String>>, TransformError> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut field_started = false;
    let mut line = 1usize;
    let mut quote_line = 0usize;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            match ch {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(ch);
                }
                _ => field.push(ch),
            }
            continue;
        }

        match ch {
            '"' if !field_started => {
                in_quotes = true;
                field_started = true;
                quote_line = line;
            }
            ',' => {
                record.push(std::mem::take(&mut field));
                field_started = false;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' | '\r' => {
                line += 1;
                if field_started || !record.is_empty() || !field.is_empty() {
                    record.push(std::mem::take(&mut field));
                    records.push(std::mem::take(&mut record));
                }
                field_started = false;
            }
            _ => {
                field.push(ch);
                field_started = true;
            }
        }
    }

    if in_quotes {
        return Err(TransformError::Csv {
            line: quote_line,
            reason: "unterminated quoted field".to_string(),
        });
    }
    if field_started || !record.is_empty() || !field.is_empty() {
        record.push(field);
        records.push(record);
    }
    Ok(records)
}

/// First record is the header; each later record becomes one row. Short
/// records fill missing columns with empty strings, extra fields are ignored.
pub fn parse_csv(text: &str) -> Result<Vec<RawRow>, TransformError> {
    let mut records = split_records(text)?.into_iter();
    let Some(header) = records.next() else {
        return Ok(Vec::new());
    };
    let header = header
        .into_iter()
        .map(|h| h.trim().to_string())
        .collect::<Vec<_>>();

    Ok(records
        .map(|fields| {
            let mut fields = fields.into_iter();
            header
                .iter()
                .map(|column| (column.clone(), fields.next().unwrap_or_default()))
                .collect::<RawRow>()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_commas_are_kept_verbatim() {
        let text = "keyword,file_link,notes\n\
                    \"Algebra, linear\",https://x/1,\"says \"\"hi\"\"\"\n\
                    Geometry,https://x/2,\n";
        let rows = parse_csv(text).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("keyword"), Some("Algebra, linear"));
        assert_eq!(rows[0].get("notes"), Some("says \"hi\""));
        assert_eq!(rows[1].get("keyword"), Some("Geometry"));
        assert_eq!(rows[1].get("notes"), Some(""));
    }

    #[test]
    fn crlf_bom_and_embedded_newlines() {
        let text = "\u{feff}id,comment\r\n1,\"two\r\nlines\"\r\n2,plain\r\n\r\n";
        let rows = parse_csv(text).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("id"), Some("1"));
        assert_eq!(rows[0].get("comment"), Some("two\r\nlines"));
        assert_eq!(rows[1].get("comment"), Some("plain"));
    }

    #[test]
    fn short_rows_are_padded_and_missing_trailing_newline_is_fine() {
        let rows = parse_csv("a,b,c\n1,2\n3,4,5").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("c"), Some(""));
        assert_eq!(rows[1].get("c"), Some("5"));
    }

    #[test]
    fn extra_fields_beyond_the_header_are_ignored() {
        let rows = parse_csv("a,b\n1,2,3,4\n").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("b"), Some("2"));
        assert_eq!(rows[0].get("3"), None);
        assert_eq!(rows[0].len(), 2);
    }

    #[test]
    fn header_only_and_empty_inputs_yield_no_rows() {
        assert!(parse_csv("").unwrap().is_empty());
        assert!(parse_csv("a,b\n").unwrap().is_empty());
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        let err = parse_csv("a,b\n1,\"open\n2,3\n").unwrap_err();
        match err {
            TransformError::Csv { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn row_count_matches_data_rows_with_many_quoted_commas() {
        let mut text = String::from("name,address\n");
        for i in 0..50 {
            text.push_str(&format!("\"Student {i}\",\"Jl. Merdeka {i}, Jakarta, ID\"\n"));
        }
        let rows = parse_csv(&text).unwrap();
        assert_eq!(rows.len(), 50);
        assert!(rows
            .iter()
            .all(|r| r.get("address").map(|a| a.matches(',').count()) == Some(2)));
    }
}
