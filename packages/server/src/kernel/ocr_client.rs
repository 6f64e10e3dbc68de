//! HTTP client for a remote OCR service.
//!
//! The engine itself runs elsewhere; this adapter posts the document
//! reference, waits for the synchronous result, and maps the response into
//! artifact payloads plus an outcome hint.

use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::common::error::Result;
use crate::domains::artifacts::ArtifactMetadata;
use crate::domains::jobs::OcrParams;

use super::{ArtifactPayload, CollabContext, CollaboratorOutput, OcrEngine};

pub struct HttpOcrEngine {
    client: Client,
    base_url: String,
    api_key: String,
}

/// Placeholder engine for deployments without an OCR backend; OCR jobs
/// fail terminally instead of retrying forever.
pub struct DisabledOcrEngine;

#[async_trait]
impl OcrEngine for DisabledOcrEngine {
    async fn process(
        &self,
        _params: &OcrParams,
        _ctx: &CollabContext,
    ) -> Result<CollaboratorOutput> {
        Ok(CollaboratorOutput::terminal(
            "no OCR engine configured on this deployment",
        ))
    }
}

#[derive(Serialize)]
struct OcrRequest<'a> {
    document_url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dpi: Option<u32>,
}

#[derive(Deserialize)]
struct OcrResponse {
    text: String,
    pages: Vec<OcrPage>,
    #[serde(default)]
    language: Option<String>,
}

#[derive(Deserialize)]
struct OcrPage {
    #[allow(dead_code)]
    number: u32,
    #[serde(default)]
    confidence: Option<f32>,
}

impl HttpOcrEngine {
    pub fn new(base_url: String, api_key: String) -> AnyResult<Self> {
        let client = Client::builder()
            .build()
            .context("Failed to create OCR HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl OcrEngine for HttpOcrEngine {
    async fn process(
        &self,
        params: &OcrParams,
        ctx: &CollabContext,
    ) -> Result<CollaboratorOutput> {
        let request = OcrRequest {
            document_url: &params.document_url,
            language: params.language.as_deref(),
            dpi: params.dpi,
        };

        let send = self
            .client
            .post(format!("{}/v1/ocr", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(ctx.timeout)
            .json(&request)
            .send();

        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Ok(CollaboratorOutput::retryable("ocr cancelled before completion"));
            }
            response = send => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                return Ok(CollaboratorOutput::retryable(format!(
                    "ocr service request failed: {e}"
                )));
            }
        };

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Ok(CollaboratorOutput::retryable(format!(
                "ocr service returned HTTP {status}"
            )));
        }
        if !status.is_success() {
            return Ok(CollaboratorOutput::terminal(format!(
                "ocr service rejected document: HTTP {status}"
            )));
        }

        let body: OcrResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                return Ok(CollaboratorOutput::retryable(format!(
                    "ocr response decode failed: {e}"
                )));
            }
        };

        let page_count = body.pages.len() as u32;
        let confidences: Vec<f32> = body.pages.iter().filter_map(|p| p.confidence).collect();
        let ocr_confidence = if confidences.is_empty() {
            None
        } else {
            Some(confidences.iter().sum::<f32>() / confidences.len() as f32)
        };

        debug!(
            document_url = %params.document_url,
            page_count,
            "ocr completed"
        );

        let artifact = ArtifactPayload {
            content_type: "text/plain".into(),
            data: Bytes::from(body.text),
            metadata: ArtifactMetadata {
                source_url: Some(params.document_url.clone()),
                page_count: Some(page_count),
                language: body.language.or_else(|| params.language.clone()),
                ocr_confidence,
                ..Default::default()
            },
        };

        Ok(CollaboratorOutput::ok(vec![artifact]))
    }
}
