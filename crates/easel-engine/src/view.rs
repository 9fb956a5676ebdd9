use easel_contracts::events::ActivityEvent;
use easel_contracts::gallery::{GeneratedImage, Notice};
use indexmap::IndexMap;

use crate::generator::{
    GenerateError, GenerationRequest, GenerationResult, ImageGenerator, ResponseFormat,
    DEFAULT_MODEL,
};
use crate::state::LocalState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitState {
    Idle,
    Submitting { ticket: u64 },
}

/// Handed out when a submission starts; carries a snapshot of the form fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSubmission {
    pub ticket: u64,
    pub request: GenerationRequest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Created { id: String },
    /// The image came back but the gallery could not be saved, so nothing was added.
    NotPersisted { detail: String },
    Failed { notice: Notice },
    /// The ticket did not match the in-flight submission.
    Ignored,
}

/// The gallery view-model: form fields, notice slot, persisted gallery and main slot.
///
/// Every mutation of the gallery is written to storage first and applied in memory only
/// once the write succeeded, so a reload never loses a confirmed record and a failed
/// write leaves the view exactly as it was.
pub struct GalleryView {
    state: LocalState,
    images: IndexMap<String, GeneratedImage>,
    main_id: Option<String>,
    api_key: String,
    prompt: String,
    notice: Option<Notice>,
    submit: SubmitState,
    next_ticket: u64,
    model: String,
    response_format: ResponseFormat,
}

impl GalleryView {
    pub fn init(mut state: LocalState) -> Self {
        let loaded = state.load_gallery();
        let api_key = state.load_api_key();
        let images = loaded
            .images
            .into_iter()
            .map(|image| (image.id.clone(), image))
            .collect::<IndexMap<String, GeneratedImage>>();
        Self {
            state,
            images,
            main_id: None,
            api_key,
            prompt: String::new(),
            notice: loaded.notice,
            submit: SubmitState::Idle,
            next_ticket: 1,
            model: DEFAULT_MODEL.to_string(),
            response_format: ResponseFormat::default(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_response_format(mut self, response_format: ResponseFormat) -> Self {
        self.response_format = response_format;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Updates the credential field and writes it through on every change.
    pub fn set_api_key(&mut self, value: &str) {
        self.api_key = value.to_string();
        // Failure is logged by the store; the field keeps the typed value.
        let _ = self.state.save_api_key(value);
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn set_prompt(&mut self, value: &str) {
        self.prompt = value.to_string();
    }

    pub fn state(&self) -> &SubmitState {
        &self.submit
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.submit, SubmitState::Submitting { .. })
    }

    pub fn can_submit(&self) -> bool {
        !self.is_loading() && !self.api_key.trim().is_empty() && !self.prompt.trim().is_empty()
    }

    /// Idle -> Submitting. Returns `None` when the guard does not hold.
    pub fn begin_submit(&mut self) -> Option<PendingSubmission> {
        if !self.can_submit() {
            return None;
        }
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.submit = SubmitState::Submitting { ticket };
        Some(PendingSubmission {
            ticket,
            request: GenerationRequest {
                api_key: self.api_key.trim().to_string(),
                prompt: self.prompt.clone(),
                model: self.model.clone(),
                response_format: self.response_format,
            },
        })
    }

    /// Submitting -> Idle, applying the result of the remote call.
    pub fn finish_submit(
        &mut self,
        pending: &PendingSubmission,
        result: Result<GenerationResult, GenerateError>,
    ) -> SubmitOutcome {
        if self.submit != (SubmitState::Submitting { ticket: pending.ticket }) {
            return SubmitOutcome::Ignored;
        }
        self.submit = SubmitState::Idle;

        let generated = match result {
            Ok(generated) => generated,
            Err(err) => {
                let notice = match &err {
                    GenerateError::NoImage => Notice::NoImageFound,
                    GenerateError::Service { message, .. } => Notice::GenerationFailed {
                        message: message.clone(),
                    },
                };
                self.state.log(&ActivityEvent::GenerationFailed {
                    ticket: pending.ticket,
                    error: err.to_string(),
                });
                self.notice = Some(notice.clone());
                return SubmitOutcome::Failed { notice };
            }
        };

        let record = GeneratedImage::new(
            generated.payload,
            pending.request.prompt.clone(),
            generated.revised_prompt,
        );
        let mut next = self.images.values().cloned().collect::<Vec<GeneratedImage>>();
        next.push(record.clone());
        if let Err(err) = self.state.save_gallery(&next) {
            let detail = err.to_string();
            self.notice = Some(Notice::StorageWriteFailed {
                detail: detail.clone(),
            });
            return SubmitOutcome::NotPersisted { detail };
        }

        let id = record.id.clone();
        self.state.log(&ActivityEvent::ImageGenerated {
            ticket: pending.ticket,
            image_id: id.clone(),
            payload: record.payload.kind().to_string(),
            model: pending.request.model.clone(),
        });
        tracing::info!(image_id = %id, "image generated");
        self.images.insert(id.clone(), record);
        self.main_id = Some(id.clone());
        self.notice = None;
        SubmitOutcome::Created { id }
    }

    /// Runs a whole submission on the calling thread.
    pub fn submit_with(&mut self, generator: &dyn ImageGenerator) -> Option<SubmitOutcome> {
        let pending = self.begin_submit()?;
        let result = generator.generate(&pending.request);
        Some(self.finish_submit(&pending, result))
    }

    /// Gallery in insertion order.
    pub fn images(&self) -> impl Iterator<Item = &GeneratedImage> {
        self.images.values()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&GeneratedImage> {
        self.images.get(id)
    }

    /// 1-based position in the gallery.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.images.get_index_of(id).map(|index| index + 1)
    }

    pub fn main_image(&self) -> Option<&GeneratedImage> {
        self.main_id.as_deref().and_then(|id| self.images.get(id))
    }

    /// Promotes a gallery item to the main slot.
    pub fn select(&mut self, id: &str) -> bool {
        if !self.images.contains_key(id) {
            return false;
        }
        self.main_id = Some(id.to_string());
        true
    }

    /// Removes exactly one record, keeping the order of the rest. Allowed mid-submission.
    pub fn delete(&mut self, id: &str) -> Result<bool, Notice> {
        if !self.images.contains_key(id) {
            return Ok(false);
        }
        let next = self
            .images
            .values()
            .filter(|image| image.id != id)
            .cloned()
            .collect::<Vec<GeneratedImage>>();
        if let Err(err) = self.state.save_gallery(&next) {
            let notice = Notice::StorageWriteFailed {
                detail: err.to_string(),
            };
            self.notice = Some(notice.clone());
            return Err(notice);
        }
        self.images.shift_remove(id);
        if self.main_id.as_deref() == Some(id) {
            self.main_id = None;
        }
        self.state.log(&ActivityEvent::ImageDeleted {
            image_id: id.to_string(),
        });
        Ok(true)
    }

    pub fn notice(&self) -> Option<&Notice> {
        self.notice.as_ref()
    }

    pub fn dismiss_notice(&mut self) {
        self.notice = None;
    }
}
