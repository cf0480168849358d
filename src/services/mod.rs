pub(crate) mod feedback;
pub(crate) mod image_prep;
pub(crate) mod ollama;
pub(crate) mod page_store;
pub(crate) mod pdf_render;
pub(crate) mod storage;
pub(crate) mod vision_extract;
