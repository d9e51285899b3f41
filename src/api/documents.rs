//! Service and metadata documents.
//!
//! Both documents are static files shipped next to the binary, read on every
//! request so they can be swapped without a restart. The metadata document
//! exists in a JSON and an XML rendition; which one is returned depends on
//! the `$format` query parameter or, failing that, the `Accept` header.

/// OData service document (JSON only).
pub const SERVICE_DOCUMENT_FILE: &str = "./service.json";
/// Metadata document, JSON rendition.
pub const METADATA_JSON_FILE: &str = "./metadata.json";
/// Metadata document, XML rendition.
pub const METADATA_XML_FILE: &str = "./metadata.xml";

/// Negotiated metadata rendition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataFormat {
    Json,
    Xml,
}

impl MetadataFormat {
    pub fn file(self) -> &'static str {
        match self {
            Self::Json => METADATA_JSON_FILE,
            Self::Xml => METADATA_XML_FILE,
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Xml => "application/xml",
        }
    }
}

/// Pick the metadata rendition. A `$format` value other than the two exact
/// media types is an error (400); without `$format`, XML is the default and
/// JSON is returned iff the `Accept` header mentions it.
pub fn negotiate_metadata(
    format_param: Option<&str>,
    accept: Option<&str>,
) -> Result<MetadataFormat, ()> {
    let accept = match format_param {
        Some(format @ ("application/json" | "application/xml")) => format,
        Some(_) => return Err(()),
        None => accept.unwrap_or_default(),
    };

    if accept.contains("application/json") {
        Ok(MetadataFormat::Json)
    } else {
        Ok(MetadataFormat::Xml)
    }
}
