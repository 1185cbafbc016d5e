//! DownloadMutationFile SOAP request and response

use chrono::NaiveDate;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{IngestError, Result};

pub const HEADER_NAMESPACE: &str = "http://schemas.ep-online.nl/EpbdDownloadMutationFileHeader";
pub const SERVICE_NAMESPACE: &str = "http://schemas.ep-online.nl/EpbdDownloadMutationFileService";

/// Request body asking for the mutation file of `date`
pub fn build_envelope(username: &str, password: &str, date: NaiveDate) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xmlns:xsd="http://www.w3.org/2001/XMLSchema" xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Header>
    <EpbdDownloadMutationFileHeader xmlns="{header_ns}">
      <username>{username}</username>
      <password>{password}</password>
    </EpbdDownloadMutationFileHeader>
  </soap:Header>
  <soap:Body>
    <DownloadMutationFile xmlns="{service_ns}">
      <request>
        <mutationType>Mutation</mutationType>
        <date>{date}</date>
      </request>
    </DownloadMutationFile>
  </soap:Body>
</soap:Envelope>"#,
        header_ns = HEADER_NAMESPACE,
        service_ns = SERVICE_NAMESPACE,
        username = escape(username),
        password = escape(password),
        date = date.format("%Y-%m-%d"),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capture {
    None,
    DownloadUrl,
    FaultString,
}

/// What a DownloadMutationFile response says
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocatorResponse {
    Url(String),
    /// No `downloadURL`, or an empty one
    NotPublished,
    Fault(String),
}

/// Read a DownloadMutationFile response body. Bodies that are not XML are
/// locator errors.
pub fn parse_response(body: &[u8]) -> Result<LocatorResponse> {
    let mut reader = Reader::from_reader(body);
    let mut capture = Capture::None;
    let mut text = String::new();
    let mut url = None;
    let mut fault: Option<String> = None;
    let mut saw_element = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| IngestError::Locator(format!("Invalid SOAP response: {}", e)))?;

        match event {
            Event::Start(start) => {
                saw_element = true;
                capture = match start.local_name().as_ref() {
                    b"downloadURL" => Capture::DownloadUrl,
                    b"faultstring" => Capture::FaultString,
                    b"Fault" => {
                        fault.get_or_insert_with(String::new);
                        Capture::None
                    },
                    _ => capture,
                };
                text.clear();
            },
            Event::Empty(empty) => {
                saw_element = true;
                if empty.local_name().as_ref() == b"Fault" {
                    fault.get_or_insert_with(String::new);
                }
            },
            Event::Text(t) if capture != Capture::None => {
                let value = t
                    .unescape()
                    .map_err(|e| IngestError::Locator(format!("Invalid SOAP response: {}", e)))?;
                text.push_str(&value);
            },
            Event::CData(cdata) if capture != Capture::None => {
                text.push_str(&String::from_utf8_lossy(&cdata));
            },
            Event::End(_) => {
                match capture {
                    Capture::DownloadUrl => url = Some(text.trim().to_string()),
                    Capture::FaultString => fault = Some(text.trim().to_string()),
                    Capture::None => {},
                }
                capture = Capture::None;
                text.clear();
            },
            Event::Eof => break,
            _ => {},
        }
    }

    if !saw_element {
        return Err(IngestError::Locator("SOAP response is not XML".to_string()));
    }
    if let Some(message) = fault {
        if message.is_empty() {
            return Ok(LocatorResponse::Fault("unspecified".to_string()));
        }
        return Ok(LocatorResponse::Fault(message));
    }

    Ok(match url {
        Some(url) if !url.is_empty() => LocatorResponse::Url(url),
        _ => LocatorResponse::NotPublished,
    })
}

/// Download URL from a response; `None` when nothing is published.
///
/// A SOAP fault is a locator error.
pub fn parse_download_url(body: &[u8]) -> Result<Option<String>> {
    match parse_response(body)? {
        LocatorResponse::Url(url) => Ok(Some(url)),
        LocatorResponse::NotPublished => Ok(None),
        LocatorResponse::Fault(message) => {
            Err(IngestError::Locator(format!("SOAP fault: {}", message)))
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn response(inner: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <DownloadMutationFileResponse xmlns="http://schemas.ep-online.nl/EpbdDownloadMutationFileService">
      <DownloadMutationFileResult xmlns="http://schemas.ep-online.nl/EpbdDownloadMutationFileResponse">
        {}
      </DownloadMutationFileResult>
    </DownloadMutationFileResponse>
  </soap:Body>
</soap:Envelope>"#,
            inner
        )
    }

    #[test]
    fn test_envelope_escapes_credentials() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        let envelope = build_envelope("user", "p<a&ss", date);

        assert!(envelope.contains("<username>user</username>"));
        assert!(envelope.contains("<password>p&lt;a&amp;ss</password>"));
        assert!(envelope.contains("<date>2024-03-07</date>"));
        assert!(envelope.contains("<mutationType>Mutation</mutationType>"));
        assert!(envelope.contains(HEADER_NAMESPACE));
    }

    #[test]
    fn test_parse_download_url() {
        let body = response(
            "<downloadURL>https://example.org/files/m.zip?id=1&amp;t=2</downloadURL>",
        );
        let url = parse_download_url(body.as_bytes()).unwrap();
        assert_eq!(url.as_deref(), Some("https://example.org/files/m.zip?id=1&t=2"));
    }

    #[test]
    fn test_missing_or_empty_url_is_not_published() {
        assert_eq!(parse_download_url(response("").as_bytes()).unwrap(), None);
        assert_eq!(
            parse_download_url(response("<downloadURL>  </downloadURL>").as_bytes()).unwrap(),
            None
        );
        assert_eq!(parse_download_url(response("<downloadURL/>").as_bytes()).unwrap(), None);
    }

    #[test]
    fn test_fault_is_locator_error() {
        let body = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body><soap:Fault><faultcode>soap:Client</faultcode>
  <faultstring>Invalid credentials</faultstring></soap:Fault></soap:Body></soap:Envelope>"#;

        assert_eq!(
            parse_response(body.as_bytes()).unwrap(),
            LocatorResponse::Fault("Invalid credentials".to_string())
        );
        match parse_download_url(body.as_bytes()) {
            Err(IngestError::Locator(message)) => assert!(message.contains("Invalid credentials")),
            other => panic!("expected Locator error, got {:?}", other),
        }
    }

    #[test]
    fn test_non_xml_is_locator_error() {
        assert!(matches!(
            parse_download_url(b"Service Unavailable"),
            Err(IngestError::Locator(_))
        ));
        assert!(matches!(parse_download_url(b""), Err(IngestError::Locator(_))));
    }
}
