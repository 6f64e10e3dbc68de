//! Typed job parameters.
//!
//! Raw client JSON is validated once at the intake boundary against the
//! kind's schema and becomes a strongly-typed value; nothing downstream
//! touches untyped payloads.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::common::error::{Error, Result};
use crate::common::JobKind;

/// The only schema version currently served per kind.
pub const SCHEMA_VERSION: i32 = 1;

const MAX_CRAWL_DEPTH: u32 = 5;
const MAX_CRAWL_PAGES: u32 = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Parameters {
    Scrape(ScrapeParams),
    Ocr(OcrParams),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScrapeParams {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OcrParams {
    pub document_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dpi: Option<u32>,
}

impl Parameters {
    pub fn kind(&self) -> JobKind {
        match self {
            Parameters::Scrape(_) => JobKind::Scrape,
            Parameters::Ocr(_) => JobKind::Ocr,
        }
    }

    /// Validate a raw payload against the kind's schema and produce the
    /// typed value. `schema_version` must name a supported version.
    pub fn from_value(
        kind: JobKind,
        schema_version: Option<i32>,
        value: serde_json::Value,
    ) -> Result<Parameters> {
        if let Some(version) = schema_version {
            if version != SCHEMA_VERSION {
                return Err(Error::SchemaNotFound(format!("{kind} v{version}")));
            }
        }

        let params = match kind {
            JobKind::Scrape => {
                let params: ScrapeParams = serde_json::from_value(value).map_err(|e| {
                    Error::InvalidRequest(format!("invalid scrape parameters: {e}"))
                })?;
                params.validate()?;
                Parameters::Scrape(params)
            }
            JobKind::Ocr => {
                let params: OcrParams = serde_json::from_value(value)
                    .map_err(|e| Error::InvalidRequest(format!("invalid ocr parameters: {e}")))?;
                params.validate()?;
                Parameters::Ocr(params)
            }
        };
        Ok(params)
    }
}

fn require_http_url(field: &str, raw: &str) -> Result<()> {
    let url = Url::parse(raw)
        .map_err(|e| Error::InvalidRequest(format!("{field} is not a valid url: {e}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(Error::InvalidRequest(format!(
            "{field} must be http or https, got {}",
            url.scheme()
        )));
    }
    Ok(())
}

impl ScrapeParams {
    fn validate(&self) -> Result<()> {
        require_http_url("url", &self.url)?;
        if let Some(selector) = &self.selector {
            if selector.trim().is_empty() {
                return Err(Error::InvalidRequest("selector must not be empty".into()));
            }
        }
        if let Some(depth) = self.max_depth {
            if depth > MAX_CRAWL_DEPTH {
                return Err(Error::InvalidRequest(format!(
                    "max_depth must be <= {MAX_CRAWL_DEPTH}"
                )));
            }
        }
        if let Some(pages) = self.max_pages {
            if pages == 0 || pages > MAX_CRAWL_PAGES {
                return Err(Error::InvalidRequest(format!(
                    "max_pages must be in 1..={MAX_CRAWL_PAGES}"
                )));
            }
        }
        Ok(())
    }
}

impl OcrParams {
    fn validate(&self) -> Result<()> {
        require_http_url("document_url", &self.document_url)?;
        if let Some(language) = &self.language {
            if language.is_empty() || language.len() > 8 || !language.is_ascii() {
                return Err(Error::InvalidRequest(
                    "language must be a short ascii language tag".into(),
                ));
            }
        }
        if let Some(dpi) = self.dpi {
            if !(72..=600).contains(&dpi) {
                return Err(Error::InvalidRequest("dpi must be in 72..=600".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scrape_params_validate() {
        let params = Parameters::from_value(
            JobKind::Scrape,
            None,
            json!({"url": "http://example.test/a", "max_depth": 1}),
        )
        .unwrap();
        assert_eq!(params.kind(), JobKind::Scrape);
    }

    #[test]
    fn scrape_rejects_non_http_scheme() {
        let result =
            Parameters::from_value(JobKind::Scrape, None, json!({"url": "ftp://example.test"}));
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn unknown_fields_rejected() {
        let result = Parameters::from_value(
            JobKind::Scrape,
            None,
            json!({"url": "http://example.test", "bogus": true}),
        );
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn kind_mismatch_rejected() {
        // OCR payload submitted under the scrape kind fails scrape's schema.
        let result = Parameters::from_value(
            JobKind::Scrape,
            None,
            json!({"document_url": "http://example.test/doc.pdf"}),
        );
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn unsupported_schema_version() {
        let result = Parameters::from_value(
            JobKind::Ocr,
            Some(7),
            json!({"document_url": "http://example.test/doc.pdf"}),
        );
        assert!(matches!(result, Err(Error::SchemaNotFound(_))));
    }

    #[test]
    fn ocr_bounds_checked() {
        assert!(Parameters::from_value(
            JobKind::Ocr,
            None,
            json!({"document_url": "http://example.test/d.pdf", "dpi": 1200}),
        )
        .is_err());
        assert!(Parameters::from_value(
            JobKind::Ocr,
            None,
            json!({"document_url": "http://example.test/d.pdf", "language": "a-language-tag-way-too-long"}),
        )
        .is_err());
    }

    #[test]
    fn untagged_round_trip_preserves_kind() {
        let original = Parameters::Ocr(OcrParams {
            document_url: "http://example.test/d.pdf".into(),
            language: Some("en".into()),
            dpi: None,
        });
        let json = serde_json::to_value(&original).unwrap();
        let back: Parameters = serde_json::from_value(json).unwrap();
        assert_eq!(original, back);
    }
}
