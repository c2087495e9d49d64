mod headers;

pub use self::headers::parse_header_pairs;
