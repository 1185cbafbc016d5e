//! Domain model for EPBD building certificates and mutation batches

use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Certificate Fields
// ============================================================================

/// Scalar type of a certificate column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// `char(n)`
    FixedText(u16),
    /// `varchar(n)`
    Text(u16),
    Integer,
    Date,
    Real,
    Boolean,
}

impl ColumnType {
    /// Type used in `CREATE TABLE`
    pub fn ddl(self) -> String {
        match self {
            ColumnType::FixedText(n) => format!("char({})", n),
            ColumnType::Text(n) => format!("varchar({})", n),
            ColumnType::Integer => "integer".to_string(),
            ColumnType::Date => "date".to_string(),
            ColumnType::Real => "real".to_string(),
            ColumnType::Boolean => "boolean".to_string(),
        }
    }

    /// Cast applied to a text bind parameter
    pub fn cast(self) -> &'static str {
        match self {
            ColumnType::FixedText(_) | ColumnType::Text(_) => "text",
            ColumnType::Integer => "integer",
            ColumnType::Date => "date",
            ColumnType::Real => "real",
            ColumnType::Boolean => "boolean",
        }
    }
}

/// The fixed column set of a building certificate.
///
/// Declaration order is column order in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    PostalCode,
    HouseNumber,
    HouseNumberSuffix,
    BuildingObjectId,
    SurveyDate,
    CalculationType,
    EnergyPerformanceIndex,
    EnergyClass,
    RegistrationDate,
    LabelIsPrivate,
    MeasurementValidUntil,
    BuildingClass,
    BuildingType,
    BuildingSubtype,
    ActivityCode,
}

impl Field {
    pub const ALL: [Field; 15] = [
        Field::PostalCode,
        Field::HouseNumber,
        Field::HouseNumberSuffix,
        Field::BuildingObjectId,
        Field::SurveyDate,
        Field::CalculationType,
        Field::EnergyPerformanceIndex,
        Field::EnergyClass,
        Field::RegistrationDate,
        Field::LabelIsPrivate,
        Field::MeasurementValidUntil,
        Field::BuildingClass,
        Field::BuildingType,
        Field::BuildingSubtype,
        Field::ActivityCode,
    ];

    /// Element name in the feed
    pub fn element(self) -> &'static str {
        match self {
            Field::PostalCode => "Pand_postcode",
            Field::HouseNumber => "Pand_huisnummer",
            Field::HouseNumberSuffix => "Pand_huisnummer_toev",
            Field::BuildingObjectId => "Pand_bagverblijfsobjectid",
            Field::SurveyDate => "Pand_opnamedatum",
            // Misspelling is the provider's.
            Field::CalculationType => "Pand_berekingstype",
            Field::EnergyPerformanceIndex => "Pand_energieprestatieindex",
            Field::EnergyClass => "Pand_energieklasse",
            Field::RegistrationDate => "Pand_registratiedatum",
            Field::LabelIsPrivate => "Pand_energielabel_is_prive",
            Field::MeasurementValidUntil => "Meting_geldig_tot",
            Field::BuildingClass => "Pand_gebouwklasse",
            Field::BuildingType => "Pand_gebouwtype",
            Field::BuildingSubtype => "Pand_gebouwsubtype",
            Field::ActivityCode => "Pand_SBIcode",
        }
    }

    /// Column name; Postgres folds the unquoted element name to lower case.
    pub fn column(self) -> String {
        self.element().to_lowercase()
    }

    pub fn column_type(self) -> ColumnType {
        match self {
            Field::PostalCode => ColumnType::FixedText(6),
            Field::HouseNumber => ColumnType::Integer,
            Field::HouseNumberSuffix => ColumnType::Text(7),
            Field::BuildingObjectId => ColumnType::Text(17),
            Field::SurveyDate => ColumnType::Date,
            Field::CalculationType => ColumnType::Text(76),
            Field::EnergyPerformanceIndex => ColumnType::Real,
            Field::EnergyClass => ColumnType::Text(6),
            Field::RegistrationDate => ColumnType::Date,
            Field::LabelIsPrivate => ColumnType::Boolean,
            Field::MeasurementValidUntil => ColumnType::Date,
            Field::BuildingClass => ColumnType::FixedText(1),
            Field::BuildingType => ColumnType::Text(44),
            Field::BuildingSubtype => ColumnType::Text(19),
            Field::ActivityCode => ColumnType::Integer,
        }
    }

    /// Look a field up by its element name
    pub fn from_element(name: &str) -> Option<Field> {
        Field::ALL.iter().copied().find(|f| f.element() == name)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.element())
    }
}

/// Values present in one certificate record.
///
/// A field that is absent here is absent from the write; it is never stored
/// as an empty string or NULL placeholder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateFields {
    values: BTreeMap<Field, String>,
}

impl CertificateFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value; empty values are treated as absent.
    pub fn set(&mut self, field: Field, value: impl Into<String>) {
        let value = value.into();
        if value.is_empty() {
            self.values.remove(&field);
        } else {
            self.values.insert(field, value);
        }
    }

    pub fn with(mut self, field: Field, value: impl Into<String>) -> Self {
        self.set(field, value);
        self
    }

    pub fn get(&self, field: Field) -> Option<&str> {
        self.values.get(&field).map(String::as_str)
    }

    pub fn contains(&self, field: Field) -> bool {
        self.values.contains_key(&field)
    }

    /// Present fields in column order
    pub fn iter(&self) -> impl Iterator<Item = (Field, &str)> {
        self.values.iter().map(|(f, v)| (*f, v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

// ============================================================================
// Row Operations
// ============================================================================

/// Per-record control code (`Stuurcode`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCode {
    Insert,
    Delete,
}

impl ControlCode {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(ControlCode::Insert),
            2 => Some(ControlCode::Delete),
            _ => None,
        }
    }
}

/// Identity a delete is matched on; all other fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeleteKey {
    pub building_object_id: String,
    pub postal_code: String,
    pub house_number: String,
}

impl DeleteKey {
    /// Extract the key, or name the first missing field.
    pub fn from_fields(fields: &CertificateFields) -> std::result::Result<Self, Field> {
        let take = |field: Field| fields.get(field).map(str::to_string).ok_or(field);

        Ok(Self {
            building_object_id: take(Field::BuildingObjectId)?,
            postal_code: take(Field::PostalCode)?,
            house_number: take(Field::HouseNumber)?,
        })
    }
}

/// One change to the certificate table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOperation {
    Insert(CertificateFields),
    Delete(DeleteKey),
}

// ============================================================================
// Batches
// ============================================================================

/// Row operations and trailing sequence number of one parsed document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedBatch {
    pub operations: Vec<RowOperation>,
    pub sequence: i64,
}

impl ParsedBatch {
    pub fn dated(self, date: NaiveDate) -> MutationBatch {
        MutationBatch {
            date,
            operations: self.operations,
            sequence: self.sequence,
        }
    }
}

/// One day's mutation file, ready to apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationBatch {
    pub date: NaiveDate,
    /// Document order; applied in this order
    pub operations: Vec<RowOperation>,
    pub sequence: i64,
}

impl MutationBatch {
    pub fn insert_count(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, RowOperation::Insert(_)))
            .count()
    }

    pub fn delete_count(&self) -> usize {
        self.operations.len() - self.insert_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_lookup_round_trip() {
        for field in Field::ALL {
            assert_eq!(Field::from_element(field.element()), Some(field));
        }
        assert_eq!(Field::from_element("Pandcertificaat"), None);
        assert_eq!(Field::ActivityCode.column(), "pand_sbicode");
    }

    #[test]
    fn test_column_types() {
        assert_eq!(Field::PostalCode.column_type().ddl(), "char(6)");
        assert_eq!(Field::CalculationType.column_type().ddl(), "varchar(76)");
        assert_eq!(Field::LabelIsPrivate.column_type().cast(), "boolean");
        assert_eq!(Field::HouseNumberSuffix.column_type().cast(), "text");
    }

    #[test]
    fn test_empty_value_is_absent() {
        let mut fields = CertificateFields::new().with(Field::PostalCode, "1234AB");
        fields.set(Field::HouseNumberSuffix, "");
        assert_eq!(fields.len(), 1);
        assert!(!fields.contains(Field::HouseNumberSuffix));

        fields.set(Field::PostalCode, "");
        assert!(fields.is_empty());
    }

    #[test]
    fn test_iter_is_column_order() {
        let fields = CertificateFields::new()
            .with(Field::ActivityCode, "6201")
            .with(Field::PostalCode, "1234AB")
            .with(Field::HouseNumber, "12");
        let order: Vec<Field> = fields.iter().map(|(f, _)| f).collect();
        assert_eq!(order, vec![Field::PostalCode, Field::HouseNumber, Field::ActivityCode]);
    }

    #[test]
    fn test_delete_key_requires_all_three_fields() {
        let fields = CertificateFields::new()
            .with(Field::BuildingObjectId, "0363010000000001")
            .with(Field::PostalCode, "1234AB");
        assert_eq!(DeleteKey::from_fields(&fields), Err(Field::HouseNumber));

        let complete = fields.with(Field::HouseNumber, "12");
        let key = DeleteKey::from_fields(&complete).unwrap_or_else(|f| panic!("missing {}", f));
        assert_eq!(key.house_number, "12");
    }

    #[test]
    fn test_control_codes() {
        assert_eq!(ControlCode::from_code(1), Some(ControlCode::Insert));
        assert_eq!(ControlCode::from_code(2), Some(ControlCode::Delete));
        assert_eq!(ControlCode::from_code(3), None);
    }
}
