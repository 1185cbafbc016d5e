//! Streaming reader for EPBD certificate documents
//!
//! Walks a mutation or full-refresh document once, front to back, and yields
//! one row operation per certificate record plus the document's sequence
//! number. Only the record being read is held in memory.
//!
//! Document shape (mutation feed):
//!
//! ```text
//! <Mutatiebericht>
//!   <Pandcertificaat>
//!     <Stuurcode>1</Stuurcode>
//!     <Pand_postcode>1234AB</Pand_postcode>
//!     ...
//!   </Pandcertificaat>
//!   ...
//!   <Mutatievolgnummer>42</Mutatievolgnummer>
//! </Mutatiebericht>
//! ```
//!
//! The full-refresh feed has no `Stuurcode` (every record is an insert) and
//! names its sequence element `LaatstVerwerkteMutatieVolgnummer`.

use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::trace;

use crate::error::{IngestError, Result};
use crate::models::{CertificateFields, ControlCode, DeleteKey, Field, RowOperation};

/// Element bounding one certificate record
pub const RECORD_ELEMENT: &str = "Pandcertificaat";

/// Per-record insert/delete flag
pub const CONTROL_CODE_ELEMENT: &str = "Stuurcode";

/// Sequence element of the daily mutation feed
pub const MUTATION_SEQUENCE_ELEMENT: &str = "Mutatievolgnummer";

/// Sequence element of the full-refresh feed
pub const FULL_REFRESH_SEQUENCE_ELEMENT: &str = "LaatstVerwerkteMutatieVolgnummer";

/// Which feed a document comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Mutation,
    FullRefresh,
}

impl DocumentKind {
    pub fn sequence_element(self) -> &'static str {
        match self {
            DocumentKind::Mutation => MUTATION_SEQUENCE_ELEMENT,
            DocumentKind::FullRefresh => FULL_REFRESH_SEQUENCE_ELEMENT,
        }
    }
}

/// Something the reader produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentItem {
    Record(RowOperation),
    Sequence(i64),
}

/// Element whose text is being buffered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Buffering {
    Nothing,
    Field(Field),
    ControlCode,
    Sequence,
}

/// State of the record being read. Reset when the record closes.
#[derive(Debug)]
struct ParserContext {
    buffering: Buffering,
    text: String,
    fields: CertificateFields,
    control_code: Option<ControlCode>,
    in_record: bool,
}

impl ParserContext {
    fn new() -> Self {
        Self {
            buffering: Buffering::Nothing,
            text: String::new(),
            fields: CertificateFields::new(),
            control_code: None,
            in_record: false,
        }
    }

    fn start_buffering(&mut self, buffering: Buffering) {
        self.buffering = buffering;
        self.text.clear();
    }

    /// Take the buffered text, trimmed, and stop buffering.
    fn finish_buffering(&mut self) -> String {
        self.buffering = Buffering::Nothing;
        let value = self.text.trim().to_string();
        self.text.clear();
        value
    }

    fn reset_record(&mut self) {
        self.fields.clear();
        self.control_code = None;
        self.in_record = false;
        self.buffering = Buffering::Nothing;
        self.text.clear();
    }
}

/// Pull-based reader over one document
pub struct RecordReader<'a> {
    reader: Reader<&'a [u8]>,
    kind: DocumentKind,
    context: ParserContext,
    depth: usize,
    root_closed: bool,
    sequence_seen: bool,
    finished: bool,
    records: usize,
}

impl<'a> RecordReader<'a> {
    pub fn new(payload: &'a [u8], kind: DocumentKind) -> Self {
        Self {
            reader: Reader::from_reader(payload),
            kind,
            context: ParserContext::new(),
            depth: 0,
            root_closed: false,
            sequence_seen: false,
            finished: false,
            records: 0,
        }
    }

    /// Records produced so far
    pub fn records(&self) -> usize {
        self.records
    }

    /// Next record or sequence number; `None` once the document is exhausted.
    ///
    /// Any error ends the walk: the document is not resumable.
    pub fn next_item(&mut self) -> Result<Option<DocumentItem>> {
        if self.finished {
            return Ok(None);
        }

        loop {
            let event = match self.reader.read_event() {
                Ok(event) => event,
                Err(e) => return Err(self.fail(format!("invalid markup: {}", e))),
            };

            match event {
                Event::Start(start) => {
                    if self.root_closed {
                        return Err(self.fail("markup after the document element".to_string()));
                    }
                    self.depth += 1;
                    let name = self.local_name(start.local_name().as_ref())?;
                    self.open(&name);
                },
                Event::Empty(empty) => {
                    if self.root_closed {
                        return Err(self.fail("markup after the document element".to_string()));
                    }
                    if self.depth == 0 {
                        self.root_closed = true;
                    }
                    let name = self.local_name(empty.local_name().as_ref())?;
                    if let Some(item) = self.empty(&name)? {
                        return Ok(Some(item));
                    }
                },
                Event::Text(text) => {
                    if self.root_closed && !text.iter().all(u8::is_ascii_whitespace) {
                        return Err(self.fail("text after the document element".to_string()));
                    }
                    if self.context.buffering != Buffering::Nothing {
                        let unescaped = match text.unescape() {
                            Ok(value) => value,
                            Err(e) => return Err(self.fail(format!("invalid text: {}", e))),
                        };
                        self.context.text.push_str(&unescaped);
                    }
                },
                Event::CData(cdata) => {
                    if self.context.buffering != Buffering::Nothing {
                        let raw: &[u8] = &cdata;
                        let value = match std::str::from_utf8(raw) {
                            Ok(value) => value.to_string(),
                            Err(e) => return Err(self.fail(format!("invalid CDATA: {}", e))),
                        };
                        self.context.text.push_str(&value);
                    }
                },
                Event::End(end) => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        self.root_closed = true;
                    }
                    let name = self.local_name(end.local_name().as_ref())?;
                    if let Some(item) = self.close(&name)? {
                        return Ok(Some(item));
                    }
                },
                Event::Eof => {
                    self.finished = true;
                    if self.depth != 0 {
                        return Err(self.fail(format!("{} element(s) left unclosed", self.depth)));
                    }
                    if !self.sequence_seen {
                        return Err(self.fail(format!(
                            "missing <{}> element",
                            self.kind.sequence_element()
                        )));
                    }
                    trace!(records = self.records, "Document exhausted");
                    return Ok(None);
                },
                // Declarations, comments, processing instructions, doctype
                _ => {},
            }
        }
    }

    fn open(&mut self, name: &str) {
        if name == RECORD_ELEMENT {
            self.context.in_record = true;
        } else if name == CONTROL_CODE_ELEMENT {
            self.context.start_buffering(Buffering::ControlCode);
        } else if name == self.kind.sequence_element() {
            self.context.start_buffering(Buffering::Sequence);
        } else if let Some(field) = Field::from_element(name) {
            if self.context.in_record {
                self.context.start_buffering(Buffering::Field(field));
            }
        }
    }

    fn empty(&mut self, name: &str) -> Result<Option<DocumentItem>> {
        if name == RECORD_ELEMENT {
            self.context.in_record = true;
            return self.close(name);
        }
        if name == self.kind.sequence_element() {
            return Err(self.fail(format!("empty <{}> element", name)));
        }
        // An empty field element is an absent field.
        Ok(None)
    }

    fn close(&mut self, name: &str) -> Result<Option<DocumentItem>> {
        match self.context.buffering {
            Buffering::Field(field) if field.element() == name => {
                let value = self.context.finish_buffering();
                self.context.fields.set(field, value);
                return Ok(None);
            },
            Buffering::ControlCode if name == CONTROL_CODE_ELEMENT => {
                let raw = self.context.finish_buffering();
                let code = self.parse_integer(&raw, CONTROL_CODE_ELEMENT)?;
                let control = match ControlCode::from_code(code) {
                    Some(control) => control,
                    None => return Err(self.fail(format!("unknown control code {}", code))),
                };
                self.context.control_code = Some(control);
                return Ok(None);
            },
            Buffering::Sequence if name == self.kind.sequence_element() => {
                let raw = self.context.finish_buffering();
                let sequence = self.parse_integer(&raw, self.kind.sequence_element())?;
                if self.sequence_seen {
                    return Err(self.fail(format!(
                        "more than one <{}> element",
                        self.kind.sequence_element()
                    )));
                }
                self.sequence_seen = true;
                return Ok(Some(DocumentItem::Sequence(sequence)));
            },
            _ => {},
        }

        if name == RECORD_ELEMENT {
            let operation = self.close_record()?;
            self.context.reset_record();
            self.records += 1;
            return Ok(Some(DocumentItem::Record(operation)));
        }

        Ok(None)
    }

    fn close_record(&mut self) -> Result<RowOperation> {
        let control = match self.kind {
            DocumentKind::FullRefresh => ControlCode::Insert,
            DocumentKind::Mutation => match self.context.control_code {
                Some(control) => control,
                None => {
                    return Err(self.fail(format!(
                        "record {} has no <{}>",
                        self.records + 1,
                        CONTROL_CODE_ELEMENT
                    )))
                },
            },
        };

        match control {
            ControlCode::Insert => {
                if self.context.fields.is_empty() {
                    return Err(self.fail(format!("record {} has no fields", self.records + 1)));
                }
                Ok(RowOperation::Insert(std::mem::take(&mut self.context.fields)))
            },
            ControlCode::Delete => match DeleteKey::from_fields(&self.context.fields) {
                Ok(key) => Ok(RowOperation::Delete(key)),
                Err(missing) => Err(self.fail(format!(
                    "delete record {} has no <{}>",
                    self.records + 1,
                    missing
                ))),
            },
        }
    }

    fn parse_integer(&mut self, raw: &str, element: &str) -> Result<i64> {
        match raw.parse::<i64>() {
            Ok(value) => Ok(value),
            Err(_) => Err(self.fail(format!("<{}> is not an integer: '{}'", element, raw))),
        }
    }

    fn local_name(&mut self, raw: &[u8]) -> Result<String> {
        match std::str::from_utf8(raw) {
            Ok(name) => Ok(name.to_string()),
            Err(e) => Err(self.fail(format!("element name is not UTF-8: {}", e))),
        }
    }

    fn fail(&mut self, message: String) -> IngestError {
        self.finished = true;
        IngestError::MalformedDocument(format!(
            "{} (at byte {})",
            message,
            self.reader.buffer_position()
        ))
    }
}

/// Read a whole document into row operations and its sequence number.
pub fn read_all(payload: &[u8], kind: DocumentKind) -> Result<(Vec<RowOperation>, i64)> {
    let mut reader = RecordReader::new(payload, kind);
    let mut operations = Vec::new();
    let mut sequence = None;

    while let Some(item) = reader.next_item()? {
        match item {
            DocumentItem::Record(op) => operations.push(op),
            DocumentItem::Sequence(n) => sequence = Some(n),
        }
    }

    // The reader refuses documents without a sequence element.
    match sequence {
        Some(sequence) => Ok((operations, sequence)),
        None => Err(IngestError::MalformedDocument(format!(
            "missing <{}> element",
            kind.sequence_element()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mutation(records: &str, sequence: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<Mutatiebericht>
{}
  <Mutatievolgnummer>{}</Mutatievolgnummer>
</Mutatiebericht>"#,
            records, sequence
        )
    }

    fn malformed_message(xml: &str, kind: DocumentKind) -> String {
        match read_all(xml.as_bytes(), kind) {
            Err(IngestError::MalformedDocument(message)) => message,
            other => panic!("expected MalformedDocument, got {:?}", other),
        }
    }

    #[test]
    fn test_insert_and_delete_records() {
        let xml = mutation(
            r#"
  <Pandcertificaat>
    <Stuurcode>1</Stuurcode>
    <Pand_postcode> 1234AB </Pand_postcode>
    <Pand_huisnummer>12</Pand_huisnummer>
    <Pand_energieklasse>A++</Pand_energieklasse>
  </Pandcertificaat>
  <Pandcertificaat>
    <Stuurcode>2</Stuurcode>
    <Pand_postcode>5678CD</Pand_postcode>
    <Pand_huisnummer>3</Pand_huisnummer>
    <Pand_bagverblijfsobjectid>0363010000000001</Pand_bagverblijfsobjectid>
  </Pandcertificaat>"#,
            "42",
        );

        let (ops, sequence) = read_all(xml.as_bytes(), DocumentKind::Mutation).unwrap();
        assert_eq!(sequence, 42);
        assert_eq!(ops.len(), 2);

        match &ops[0] {
            RowOperation::Insert(fields) => {
                assert_eq!(fields.get(Field::PostalCode), Some("1234AB"));
                assert_eq!(fields.get(Field::EnergyClass), Some("A++"));
                assert_eq!(fields.len(), 3);
            },
            other => panic!("expected insert, got {:?}", other),
        }
        assert_eq!(
            ops[1],
            RowOperation::Delete(DeleteKey {
                building_object_id: "0363010000000001".to_string(),
                postal_code: "5678CD".to_string(),
                house_number: "3".to_string(),
            })
        );
    }

    #[test]
    fn test_missing_optional_field_is_absent() {
        let xml = mutation(
            r#"<Pandcertificaat><Stuurcode>1</Stuurcode>
               <Pand_postcode>1234AB</Pand_postcode>
               <Pand_huisnummer_toev></Pand_huisnummer_toev>
               <Pand_gebouwklasse/>
               </Pandcertificaat>"#,
            "7",
        );
        let (ops, _) = read_all(xml.as_bytes(), DocumentKind::Mutation).unwrap();
        match &ops[0] {
            RowOperation::Insert(fields) => {
                assert!(!fields.contains(Field::HouseNumberSuffix));
                assert!(!fields.contains(Field::BuildingClass));
                assert_eq!(fields.len(), 1);
            },
            other => panic!("expected insert, got {:?}", other),
        }
    }

    #[test]
    fn test_fields_do_not_leak_between_records() {
        let xml = mutation(
            r#"<Pandcertificaat><Stuurcode>1</Stuurcode>
                 <Pand_postcode>1111AA</Pand_postcode><Pand_huisnummer>1</Pand_huisnummer>
                 <Pand_bagverblijfsobjectid>A1</Pand_bagverblijfsobjectid>
                 <Pand_energieklasse>B</Pand_energieklasse></Pandcertificaat>
               <Pandcertificaat><Stuurcode>1</Stuurcode>
                 <Pand_postcode>2222BB</Pand_postcode></Pandcertificaat>"#,
            "8",
        );
        let (ops, _) = read_all(xml.as_bytes(), DocumentKind::Mutation).unwrap();
        match &ops[1] {
            RowOperation::Insert(fields) => {
                assert_eq!(fields.len(), 1);
                assert_eq!(fields.get(Field::PostalCode), Some("2222BB"));
            },
            other => panic!("expected insert, got {:?}", other),
        }
    }

    #[test]
    fn test_control_code_before_record() {
        let xml = mutation(
            r#"<Stuurcode>2</Stuurcode>
               <Pandcertificaat>
                 <Pand_postcode>1111AA</Pand_postcode><Pand_huisnummer>1</Pand_huisnummer>
                 <Pand_bagverblijfsobjectid>A1</Pand_bagverblijfsobjectid>
               </Pandcertificaat>"#,
            "8",
        );
        let (ops, _) = read_all(xml.as_bytes(), DocumentKind::Mutation).unwrap();
        assert!(matches!(ops[0], RowOperation::Delete(_)));
    }

    #[test]
    fn test_control_code_does_not_carry_over() {
        let xml = mutation(
            r#"<Pandcertificaat><Stuurcode>1</Stuurcode><Pand_postcode>1111AA</Pand_postcode></Pandcertificaat>
               <Pandcertificaat><Pand_postcode>2222BB</Pand_postcode></Pandcertificaat>"#,
            "8",
        );
        let message = malformed_message(&xml, DocumentKind::Mutation);
        assert!(message.contains("record 2 has no <Stuurcode>"), "{}", message);
    }

    #[test]
    fn test_namespaced_elements_and_entities() {
        let xml = r#"<m:Mutatiebericht xmlns:m="urn:epbd">
              <m:Pandcertificaat><m:Stuurcode>1</m:Stuurcode>
                <m:Pand_gebouwtype>Twee&#xE9;&amp;onder</m:Pand_gebouwtype>
                <m:Pand_gebouwsubtype><![CDATA[hoek <1>]]></m:Pand_gebouwsubtype>
              </m:Pandcertificaat>
              <m:Mutatievolgnummer>3</m:Mutatievolgnummer>
            </m:Mutatiebericht>"#;
        let (ops, sequence) = read_all(xml.as_bytes(), DocumentKind::Mutation).unwrap();
        assert_eq!(sequence, 3);
        match &ops[0] {
            RowOperation::Insert(fields) => {
                assert_eq!(fields.get(Field::BuildingType), Some("Tweeé&onder"));
                assert_eq!(fields.get(Field::BuildingSubtype), Some("hoek <1>"));
            },
            other => panic!("expected insert, got {:?}", other),
        }
    }

    #[test]
    fn test_full_refresh_records_are_inserts() {
        let xml = r#"<Pandcertificaten>
              <Pandcertificaat><Pand_postcode>1234AB</Pand_postcode></Pandcertificaat>
              <LaatstVerwerkteMutatieVolgnummer>900</LaatstVerwerkteMutatieVolgnummer>
            </Pandcertificaten>"#;
        let (ops, sequence) = read_all(xml.as_bytes(), DocumentKind::FullRefresh).unwrap();
        assert_eq!(sequence, 900);
        assert!(matches!(ops[0], RowOperation::Insert(_)));

        // The mutation sequence element means nothing in a full-refresh document.
        let message = malformed_message(
            &mutation("", "5").replace("Mutatiebericht", "Pandcertificaten"),
            DocumentKind::FullRefresh,
        );
        assert!(message.contains("LaatstVerwerkteMutatieVolgnummer"), "{}", message);
    }

    #[test]
    fn test_malformed_documents() {
        let cases = [
            (mutation("", "abc"), "not an integer"),
            (mutation("", ""), "not an integer"),
            (
                mutation("<Pandcertificaat><Stuurcode>9</Stuurcode></Pandcertificaat>", "1"),
                "unknown control code 9",
            ),
            (
                mutation("<Pandcertificaat><Stuurcode>1</Stuurcode></Pandcertificaat>", "1"),
                "has no fields",
            ),
            (
                mutation(
                    "<Pandcertificaat><Stuurcode>2</Stuurcode><Pand_postcode>1234AB</Pand_postcode>\
                     <Pand_bagverblijfsobjectid>0363010000000001</Pand_bagverblijfsobjectid>\
                     </Pandcertificaat>",
                    "1",
                ),
                "no <Pand_huisnummer>",
            ),
            (
                mutation(
                    "<Pandcertificaat><Stuurcode>2</Stuurcode><Pand_postcode>1234AB</Pand_postcode>\
                     <Pand_huisnummer>12</Pand_huisnummer></Pandcertificaat>",
                    "1",
                ),
                "no <Pand_bagverblijfsobjectid>",
            ),
            (format!("{}<Extra/>", mutation("", "1")), "markup after the document element"),
            (
                format!("{}<Mutatiebericht></Mutatiebericht>", mutation("", "1")),
                "markup after the document element",
            ),
            (format!("{}trailing", mutation("", "1")), "text after the document element"),
            (
                "<Mutatiebericht><Pandcertificaat></Mutatiebericht>".to_string(),
                "invalid markup",
            ),
            ("<Mutatiebericht></Mutatiebericht>".to_string(), "missing <Mutatievolgnummer>"),
            (
                "<Mutatiebericht><Mutatievolgnummer>1</Mutatievolgnummer><Mutatievolgnummer>2</Mutatievolgnummer></Mutatiebericht>"
                    .to_string(),
                "more than one",
            ),
        ];

        for (xml, expected) in cases {
            let message = malformed_message(&xml, DocumentKind::Mutation);
            assert!(message.contains(expected), "expected '{}' in '{}'", expected, message);
        }
    }

    #[test]
    fn test_truncated_document() {
        let xml = "<Mutatiebericht><Mutatievolgnummer>1</Mutatievolgnummer>";
        assert!(matches!(
            read_all(xml.as_bytes(), DocumentKind::Mutation),
            Err(IngestError::MalformedDocument(_))
        ));
    }

    #[test]
    fn test_reader_stops_after_error() {
        let xml = mutation("", "abc");
        let mut reader = RecordReader::new(xml.as_bytes(), DocumentKind::Mutation);
        assert!(reader.next_item().is_err());
        assert!(matches!(reader.next_item(), Ok(None)));
    }
}
