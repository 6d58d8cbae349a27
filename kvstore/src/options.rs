//! Open and query options shared by the stores.

use std::ops::Range;

/// Options accepted by every `open` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Create the store if it does not exist.
    pub create: bool,
    /// Wipe existing contents before opening.
    pub truncate: bool,
    /// Verify structural integrity while loading.
    pub validate: bool,
    /// Log store only: truncate to the last consistent record instead of failing.
    pub fix: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            create: true,
            truncate: false,
            validate: true,
            fix: false,
        }
    }
}

impl StoreOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    #[must_use]
    pub const fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    #[must_use]
    pub const fn validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    #[must_use]
    pub const fn fix(mut self, fix: bool) -> Self {
        self.fix = fix;
        self
    }
}

/// Bounds for range iteration over logical positions.
///
/// Inclusive bounds take precedence over exclusive ones on the same side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub lt: Option<u64>,
    pub lte: Option<u64>,
    pub gt: Option<u64>,
    pub gte: Option<u64>,
    pub reverse: bool,
    pub limit: Option<u64>,
}

impl QueryOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn lt(mut self, bound: u64) -> Self {
        self.lt = Some(bound);
        self
    }

    #[must_use]
    pub const fn lte(mut self, bound: u64) -> Self {
        self.lte = Some(bound);
        self
    }

    #[must_use]
    pub const fn gt(mut self, bound: u64) -> Self {
        self.gt = Some(bound);
        self
    }

    #[must_use]
    pub const fn gte(mut self, bound: u64) -> Self {
        self.gte = Some(bound);
        self
    }

    #[must_use]
    pub const fn reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The half-open range of positions selected out of `0..length`.
    #[must_use]
    pub fn span(&self, length: u64) -> Range<u64> {
        let start = match (self.gte, self.gt) {
            (Some(gte), _) => gte,
            (None, Some(gt)) => gt.saturating_add(1),
            (None, None) => 0,
        };
        let end = match (self.lte, self.lt) {
            (Some(lte), _) => lte.saturating_add(1),
            (None, Some(lt)) => lt,
            (None, None) => length,
        };
        let end = end.min(length);
        start.min(end)..end
    }

    /// Positions in visiting order, honoring `reverse` and `limit`.
    #[must_use]
    pub fn positions(&self, length: u64) -> Positions {
        let span = self.span(length);
        let remaining = self
            .limit
            .map_or(span.end - span.start, |limit| limit.min(span.end - span.start));
        Positions {
            span,
            reverse: self.reverse,
            remaining,
        }
    }
}

/// Iterator over the positions selected by a [`QueryOptions`].
#[derive(Debug, Clone)]
pub struct Positions {
    span: Range<u64>,
    reverse: bool,
    remaining: u64,
}

impl Positions {
    /// The position the walk starts at, if any.
    #[must_use]
    pub const fn first(&self) -> Option<u64> {
        if self.remaining == 0 {
            None
        } else if self.reverse {
            Some(self.span.end - 1)
        } else {
            Some(self.span.start)
        }
    }

    #[must_use]
    pub const fn is_reverse(&self) -> bool {
        self.reverse
    }
}

impl Iterator for Positions {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        if self.reverse {
            self.span.next_back()
        } else {
            self.span.next()
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        (n, Some(n))
    }
}

impl ExactSizeIterator for Positions {}
