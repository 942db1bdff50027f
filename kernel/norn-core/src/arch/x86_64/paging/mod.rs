//! Page table walking and construction via the direct map.

mod mapper;

pub use mapper::{Attribute, PageTableMapper, PagingError};
