use serde::Deserialize;

/// Page/limit query parameters shared by the admin user listing and the
/// task listing. Pages are 1-based, matching the public API.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_page() -> i64 {
    1
}
fn default_limit() -> i64 {
    10
}

impl Default for PageQuery {
    fn default() -> Self {
        Self { page: 1, limit: 10 }
    }
}

impl PageQuery {
    /// Clamped to sane bounds so a hostile query cannot ask for page 0 or a
    /// million rows.
    pub fn normalized(self) -> Self {
        Self {
            page: self.page.max(1),
            limit: self.limit.clamp(1, 100),
        }
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.limit
    }
}

pub fn total_pages(total: i64, limit: i64) -> i64 {
    if limit <= 0 {
        return 0;
    }
    (total + limit - 1) / limit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifteen_items_limit_ten_is_two_pages() {
        assert_eq!(total_pages(15, 10), 2);
    }

    #[test]
    fn exact_multiple_and_empty() {
        assert_eq!(total_pages(20, 10), 2);
        assert_eq!(total_pages(0, 10), 0);
    }

    #[test]
    fn offset_is_one_based() {
        let q = PageQuery { page: 2, limit: 10 }.normalized();
        assert_eq!(q.offset(), 10);
    }

    #[test]
    fn normalized_clamps_bad_input() {
        let q = PageQuery { page: 0, limit: 0 }.normalized();
        assert_eq!(q.page, 1);
        assert_eq!(q.limit, 1);
        let q = PageQuery {
            page: 1,
            limit: 10_000,
        }
        .normalized();
        assert_eq!(q.limit, 100);
    }
}
