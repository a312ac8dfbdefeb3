//! ragbot - 웹 검색 + 벡터 DB 기반 RAG 답변 오케스트레이터
//!
//! 지식 베이스(LanceDB) 검색과 웹 검색을 동시에 실행해 컨텍스트를 만들고,
//! Ollama 모델로 모드별 답변을 생성합니다. 웹 결과는 백그라운드에서
//! 지식 베이스에 저장됩니다.

pub mod cli;
pub mod config;
pub mod embedding;
pub mod http;
pub mod knowledge;
pub mod llm;
pub mod pipeline;
pub mod search;

// Re-exports
pub use config::{ConfigError, Mode, ModeConfig, ModeTable, Settings, VectorBackend};
pub use embedding::{EmbeddingBackend, EmbeddingService, OllamaEmbedding};
pub use http::HttpGate;
pub use knowledge::{
    CollectionInfo, Document, DocumentStore, LanceVectorIndex, MemoryVectorIndex, RawDocument,
    StoreOptions, StoreStats, VectorIndex, get_data_dir,
};
pub use llm::{AnswerGenerator, GenerationBackend, GenerationParams, OllamaGenerator};
pub use pipeline::{BackgroundTasks, PipelineOptions, RagPipeline};
pub use search::{SearchResult, WebSearch, WebSearchClient};
