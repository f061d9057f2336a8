mod buffer_recycler_port;
mod decoder_port;
mod event_listener_port;
mod fetcher_port;
mod transformation_port;

pub use buffer_recycler_port::{BufferRecycler, DropRecycler};
pub use decoder_port::Decoder;
pub use event_listener_port::{EventListener, NoopEventListener};
pub use fetcher_port::Fetcher;
pub use transformation_port::Transformation;

#[cfg(test)]
pub use transformation_port::MockTransformation;

#[cfg(test)]
pub mod mocks {
    pub use super::buffer_recycler_port::mock::RecordingRecycler;
    pub use super::decoder_port::mock::SyntheticDecoder;
    pub use super::event_listener_port::mock::RecordingListener;
    pub use super::fetcher_port::mock::CountingFetcher;
}
