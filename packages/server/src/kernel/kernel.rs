//! The kernel holds every injected dependency behind its trait, so the
//! domains stay testable against fakes.

use std::sync::Arc;

use crate::blob::BlobStore;
use crate::bus::MessageBus;
use crate::store::MetadataStore;

use super::{Clock, KeyValidator, OcrEngine, Scraper};

pub struct Kernel {
    pub store: Arc<dyn MetadataStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub bus: Arc<dyn MessageBus>,
    pub scraper: Arc<dyn Scraper>,
    pub ocr: Arc<dyn OcrEngine>,
    pub clock: Arc<dyn Clock>,
    pub key_validator: Arc<dyn KeyValidator>,
}

impl Kernel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        bus: Arc<dyn MessageBus>,
        scraper: Arc<dyn Scraper>,
        ocr: Arc<dyn OcrEngine>,
        clock: Arc<dyn Clock>,
        key_validator: Arc<dyn KeyValidator>,
    ) -> Self {
        Self {
            store,
            blobs,
            bus,
            scraper,
            ocr,
            clock,
            key_validator,
        }
    }
}
