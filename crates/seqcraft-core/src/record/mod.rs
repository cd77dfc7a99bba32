pub mod example;
pub mod schema;
pub mod tfrecord;

pub use example::{Example, Feature};
pub use schema::{CaptionRecord, SentenceRecord, VideoRecord};
pub use tfrecord::{RecordReader, RecordWriter, masked_crc};
