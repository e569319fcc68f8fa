//! Pagination parameters used as key discriminators.

use serde::{Deserialize, Serialize};

/// Page size meaning "everything" after standardisation (2^53 - 1).
pub const MAX_SAFE_PAGE_SIZE: i64 = 9_007_199_254_740_991;

/// Page sizes a standardised query may carry, besides 0 (unpaged) and the max.
pub const STANDARD_PAGE_SIZES: [i64; 3] = [25, 50, 100];

/// A paginated query as received from a caller.
///
/// Page keys are built from all four fields, so equivalent queries should be
/// passed through [`PageQuery::standardised`] first to share one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    pub page_size: i64,
    pub page: i64,
    #[serde(default)]
    pub direction: String,
    #[serde(default)]
    pub sort: String,
}

impl PageQuery {
    pub fn new(page_size: i64, page: i64) -> Self {
        Self {
            page_size,
            page,
            ..Default::default()
        }
    }

    /// Set the sort field and direction.
    pub fn sorted_by(mut self, sort: impl Into<String>, direction: impl Into<String>) -> Self {
        self.sort = sort.into();
        self.direction = direction.into();
        self
    }

    pub fn is_paged(&self) -> bool {
        self.page_size > 0
    }

    pub fn is_unpaged(&self) -> bool {
        self.page_size == 0
    }

    /// Clamp the query onto the supported page sizes.
    ///
    /// Negative pages become 0. Negative sizes become 0 (unpaged), sizes above
    /// 100 become [`MAX_SAFE_PAGE_SIZE`], and any other non-standard size
    /// falls back to 25.
    pub fn standardised(mut self) -> Self {
        if self.page < 0 {
            self.page = 0;
        }
        if self.page_size < 0 {
            self.page_size = 0;
        } else if self.page_size > 100 {
            self.page_size = MAX_SAFE_PAGE_SIZE;
        } else if self.page_size != 0 && !STANDARD_PAGE_SIZES.contains(&self.page_size) {
            self.page_size = 25;
        }
        self
    }
}

/// Number of pages needed for `total_count` items; never less than 1.
pub fn total_pages(total_count: i64, page_size: i64) -> i64 {
    if total_count > 0 && page_size > 0 {
        let mut pages = total_count / page_size;
        if total_count % page_size != 0 {
            pages += 1;
        }
        pages
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standardised_clamps_negatives() {
        let q = PageQuery::new(-5, -1).standardised();
        assert_eq!(q.page, 0);
        assert_eq!(q.page_size, 0);
        assert!(q.is_unpaged());
    }

    #[test]
    fn test_standardised_snaps_sizes() {
        assert_eq!(PageQuery::new(25, 0).standardised().page_size, 25);
        assert_eq!(PageQuery::new(50, 0).standardised().page_size, 50);
        assert_eq!(PageQuery::new(100, 0).standardised().page_size, 100);
        assert_eq!(PageQuery::new(30, 0).standardised().page_size, 25);
        assert_eq!(PageQuery::new(101, 0).standardised().page_size, MAX_SAFE_PAGE_SIZE);
        assert_eq!(PageQuery::new(0, 3).standardised().page_size, 0);
    }

    #[test]
    fn test_total_pages() {
        assert_eq!(total_pages(40, 25), 2);
        assert_eq!(total_pages(50, 25), 2);
        assert_eq!(total_pages(0, 25), 1);
        assert_eq!(total_pages(10, 0), 1);
    }

    #[test]
    fn test_camel_case_serde() {
        let q: PageQuery = serde_json::from_str(
            r#"{"pageSize":50,"page":2,"direction":"ascending","sort":"code"}"#,
        )
        .expect("valid json");
        assert_eq!(q, PageQuery::new(50, 2).sorted_by("code", "ascending"));
    }
}
