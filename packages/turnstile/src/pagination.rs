//! Page-based pagination arguments for bulk reads.
//!
//! `page` is 1-based; `per_page` defaults to 10 and is clamped to a sane
//! maximum. An optional ordered list of `{column, direction}` pairs controls
//! result ordering.
//!
//! # Usage
//!
//! ```rust,ignore
//! let page = Pagination::new(2)
//!     .per_page(25)
//!     .order_by("created_at", Direction::Desc)
//!     .normalize();
//!
//! let entities = engine.read_all(&client, "order", Some(&page), TenancyMode::Enforced).await?;
//! ```

/// Default number of records per page.
pub const DEFAULT_PER_PAGE: u32 = 10;

/// Hard ceiling on `per_page`; larger requests are clamped, not rejected.
pub const MAX_PER_PAGE: u32 = 100;

/// Sort direction for an ordering column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// A single ordering term.
#[derive(Debug, Clone)]
pub struct Order {
    pub column: String,
    pub direction: Direction,
}

/// Input arguments for page-based pagination.
#[derive(Debug, Clone)]
pub struct Pagination {
    /// 1-based page number.
    pub page: u32,
    /// Records per page.
    pub per_page: u32,
    /// Ordering terms, applied in sequence.
    pub order: Vec<Order>,
}

impl Pagination {
    /// Create pagination for the given 1-based page with default sizing.
    pub fn new(page: u32) -> Self {
        Pagination {
            page,
            per_page: DEFAULT_PER_PAGE,
            order: Vec::new(),
        }
    }

    /// Set the page size.
    pub fn per_page(mut self, per_page: u32) -> Self {
        self.per_page = per_page;
        self
    }

    /// Append an ordering term.
    pub fn order_by(mut self, column: impl Into<String>, direction: Direction) -> Self {
        self.order.push(Order {
            column: column.into(),
            direction,
        });
        self
    }

    /// Clamp out-of-range values instead of failing the request.
    ///
    /// A zero page becomes page 1; a zero `per_page` becomes the default;
    /// oversized `per_page` is clamped to [`MAX_PER_PAGE`].
    pub fn normalize(mut self) -> Self {
        if self.page == 0 {
            self.page = 1;
        }
        if self.per_page == 0 {
            self.per_page = DEFAULT_PER_PAGE;
        }
        self.per_page = self.per_page.min(MAX_PER_PAGE);
        self
    }

    /// Zero-based offset of the first record on this page.
    pub fn offset(&self) -> usize {
        ((self.page.max(1) - 1) as usize) * self.per_page as usize
    }

    /// Number of records on a full page.
    pub fn limit(&self) -> usize {
        self.per_page as usize
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Pagination::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let p = Pagination::default();
        assert_eq!(p.page, 1);
        assert_eq!(p.per_page, DEFAULT_PER_PAGE);
        assert_eq!(p.offset(), 0);
    }

    #[test]
    fn test_offset_is_one_based() {
        let p = Pagination::new(3).per_page(20);
        assert_eq!(p.offset(), 40);
        assert_eq!(p.limit(), 20);
    }

    #[test]
    fn test_normalize_clamps() {
        let p = Pagination::new(0).per_page(10_000).normalize();
        assert_eq!(p.page, 1);
        assert_eq!(p.per_page, MAX_PER_PAGE);

        let p = Pagination::new(2).per_page(0).normalize();
        assert_eq!(p.per_page, DEFAULT_PER_PAGE);
    }

    #[test]
    fn test_order_terms_accumulate() {
        let p = Pagination::new(1)
            .order_by("created_at", Direction::Desc)
            .order_by("name", Direction::Asc);
        assert_eq!(p.order.len(), 2);
        assert_eq!(p.order[0].column, "created_at");
        assert_eq!(p.order[1].direction, Direction::Asc);
    }
}
