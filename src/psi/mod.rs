pub mod section;
pub mod pat;
pub mod pmt;

pub use pat::{build_pat, parse_pat, PatEntry, PatSection};
pub use pmt::{build_pmt, parse_pmt, PmtSection, StreamInfo};
