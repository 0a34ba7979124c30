use crate::model::{published_at, Record};
use chrono::{DateTime, Utc};
use listings_core::{Error, Result};
use serde::Serialize;
use serde_json::Value;

/// Flat warehouse row projected from one listing record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListingRow {
    pub id: Option<i64>,
    pub organization_id: Option<String>,
    pub species: Option<String>,
    pub primary_breed: Option<String>,
    pub primary_color: Option<String>,
    pub age: Option<String>,
    pub gender: Option<String>,
    pub size: Option<String>,
    pub name: Option<String>,
    pub status: Option<String>,
    pub spayed_neutered: Option<bool>,
    pub house_trained: Option<bool>,
    pub declawed: Option<bool>,
    pub special_needs: Option<bool>,
    pub shots_current: Option<bool>,
    pub good_with_children: Option<bool>,
    pub good_with_dogs: Option<bool>,
    pub good_with_cats: Option<bool>,
    /// JSON array text.
    pub tags: String,
    pub email: Option<String>,
    pub location: Option<String>,
    pub postcode: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn flag(value: Option<&Value>) -> Option<bool> {
    value?.as_bool()
}

fn nested<'a>(record: &'a Record, object: &str, field: &str) -> Option<&'a Value> {
    record.get(object)?.as_object()?.get(field)
}

pub fn contact_email(record: &Record) -> Option<&str> {
    nested(record, "contact", "email")?.as_str()
}

fn location(record: &Record) -> Option<String> {
    let address = record.get("contact")?.get("address")?.as_object()?;
    let city = address.get("city").and_then(Value::as_str).unwrap_or("");
    let state = address.get("state").and_then(Value::as_str).unwrap_or("");
    Some(
        format!("{city}, {state}")
            .trim_matches(|c| c == ',' || c == ' ')
            .to_string(),
    )
}

impl ListingRow {
    pub fn from_record(record: &Record) -> Self {
        let tags = record
            .get("tags")
            .filter(|tags| tags.is_array())
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));

        Self {
            id: record.get("id").and_then(Value::as_i64),
            organization_id: text(record.get("organization_id")),
            species: text(record.get("species")),
            primary_breed: text(nested(record, "breeds", "primary")),
            primary_color: text(nested(record, "colors", "primary")),
            age: text(record.get("age")),
            gender: text(record.get("gender")),
            size: text(record.get("size")),
            name: text(record.get("name")),
            status: text(record.get("status")),
            spayed_neutered: flag(nested(record, "attributes", "spayed_neutered")),
            house_trained: flag(nested(record, "attributes", "house_trained")),
            declawed: flag(nested(record, "attributes", "declawed")),
            special_needs: flag(nested(record, "attributes", "special_needs")),
            shots_current: flag(nested(record, "attributes", "shots_current")),
            good_with_children: flag(nested(record, "environment", "children")),
            good_with_dogs: flag(nested(record, "environment", "dogs")),
            good_with_cats: flag(nested(record, "environment", "cats")),
            tags: tags.to_string(),
            email: contact_email(record).map(str::to_string),
            location: location(record),
            postcode: record
                .get("contact")
                .and_then(|c| c.get("address"))
                .and_then(|a| text(a.get("postcode"))),
            published_at: published_at(record),
        }
    }
}

/// Renders rows as CSV with a header line. The header is written even for no rows.
pub fn rows_to_csv(rows: &[ListingRow]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());

    writer.write_record(CSV_COLUMNS).map_err(csv_error)?;
    for row in rows {
        writer.serialize(row).map_err(csv_error)?;
    }

    writer
        .into_inner()
        .map_err(|e| Error::Internal(format!("failed to flush CSV buffer: {e}")))
}

fn csv_error(e: csv::Error) -> Error {
    Error::Internal(format!("failed to encode CSV: {e}"))
}

pub const CSV_COLUMNS: [&str; 23] = [
    "id",
    "organization_id",
    "species",
    "primary_breed",
    "primary_color",
    "age",
    "gender",
    "size",
    "name",
    "status",
    "spayed_neutered",
    "house_trained",
    "declawed",
    "special_needs",
    "shots_current",
    "good_with_children",
    "good_with_dogs",
    "good_with_cats",
    "tags",
    "email",
    "location",
    "postcode",
    "published_at",
];

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn full_record() -> Record {
        json!({
            "id": 70123456,
            "organization_id": "TX514",
            "species": "Dog",
            "breeds": {"primary": "Labrador Retriever", "secondary": null},
            "colors": {"primary": "Black"},
            "age": "Young",
            "gender": "Female",
            "size": "Large",
            "name": "Rocky",
            "status": "adoptable",
            "attributes": {
                "spayed_neutered": true,
                "house_trained": false,
                "declawed": null,
                "special_needs": false,
                "shots_current": true
            },
            "environment": {"children": true, "dogs": null, "cats": false},
            "tags": ["Friendly", "Playful"],
            "contact": {
                "email": "rescue@example.org",
                "address": {"city": "Austin", "state": "TX", "postcode": "78701"}
            },
            "published_at": "2024-01-19T12:30:00+0000"
        })
        .as_object()
        .cloned()
        .unwrap_or_default()
    }

    #[test]
    fn projects_nested_fields() {
        let row = ListingRow::from_record(&full_record());

        assert_eq!(
            row,
            ListingRow {
                id: Some(70123456),
                organization_id: Some("TX514".into()),
                species: Some("Dog".into()),
                primary_breed: Some("Labrador Retriever".into()),
                primary_color: Some("Black".into()),
                age: Some("Young".into()),
                gender: Some("Female".into()),
                size: Some("Large".into()),
                name: Some("Rocky".into()),
                status: Some("adoptable".into()),
                spayed_neutered: Some(true),
                house_trained: Some(false),
                declawed: None,
                special_needs: Some(false),
                shots_current: Some(true),
                good_with_children: Some(true),
                good_with_dogs: None,
                good_with_cats: Some(false),
                tags: r#"["Friendly","Playful"]"#.into(),
                email: Some("rescue@example.org".into()),
                location: Some("Austin, TX".into()),
                postcode: Some("78701".into()),
                published_at: Some(Utc.with_ymd_and_hms(2024, 1, 19, 12, 30, 0).unwrap()),
            }
        );
    }

    #[test]
    fn missing_nested_objects_become_nulls() {
        let record = json!({"id": 1, "contact": {"address": {"state": "TX"}}})
            .as_object()
            .cloned()
            .unwrap_or_default();

        let row = ListingRow::from_record(&record);

        assert_eq!(row.primary_breed, None);
        assert_eq!(row.spayed_neutered, None);
        assert_eq!(row.email, None);
        assert_eq!(row.location.as_deref(), Some("TX"));
        assert_eq!(row.tags, "[]");
        assert_eq!(row.published_at, None);
    }

    #[test]
    fn csv_has_header_and_one_line_per_row() {
        let rows = vec![ListingRow::from_record(&full_record())];
        let csv = String::from_utf8(rows_to_csv(&rows).expect("csv")).expect("utf8");
        let lines: Vec<&str> = csv.lines().collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], CSV_COLUMNS.join(","));
        assert!(lines[1].starts_with("70123456,TX514,Dog,Labrador Retriever,"));
        assert!(lines[1].contains(r#""[""Friendly"",""Playful""]""#));
        assert!(lines[1].ends_with("2024-01-19T12:30:00Z"));
    }

    #[test]
    fn contact_email_lookup() {
        assert_eq!(contact_email(&full_record()), Some("rescue@example.org"));
        assert_eq!(contact_email(&Record::new()), None);
    }
}
