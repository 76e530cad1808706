// scrolllive-common: shared wire types for the scrolllive server and its clients

pub mod protocol;
pub mod types;
pub mod validation;
