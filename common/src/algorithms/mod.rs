mod merge;

pub use merge::merge_by;
