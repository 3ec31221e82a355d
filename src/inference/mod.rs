pub mod openai;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::InferenceError;
use crate::types::{InferenceRequest, InferenceResponse};

/// One model call. No history, no tool execution; request in, response out.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse, InferenceError>;
}

#[async_trait]
impl InferenceProvider for Box<dyn InferenceProvider> {
    async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        (**self).infer(request).await
    }
}

#[async_trait]
impl<T: InferenceProvider + ?Sized> InferenceProvider for Arc<T> {
    async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        (**self).infer(request).await
    }
}

pub use openai::OpenAiProvider;
