//! Knowledge 모듈 - 벡터 지식 저장소
//!
//! - VectorIndex: 벡터 DB 엔진 인터페이스 (LanceDB / 인메모리)
//! - DocumentStore: 문서 검증, 임베딩, 유사도 검색, 기간 기반 정리

mod store;
mod vector;
mod lance;
mod memory;

// Re-exports
pub use store::{
    DocumentStore, RawDocument, StoreOptions, StoreStats, CollectionInfo,
    get_data_dir,
};
pub use vector::{
    VectorIndex, Document, IndexHit, StoredMetadata,
    cosine_similarity, cosine_distance, iso_timestamp,
    TIMESTAMP_FORMAT,
};
pub use lance::LanceVectorIndex;
pub use memory::MemoryVectorIndex;
