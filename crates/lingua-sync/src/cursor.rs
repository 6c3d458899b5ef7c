/// Proof that a page fetch was started. Completing with a ticket from an
/// earlier generation is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTicket {
    pub page: u32,
    pub size: u32,
    generation: u32,
}

/// Paging state for one paginated source: IDLE → FETCHING → IDLE, with at
/// most one fetch in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor {
    page_index: u32,
    page_size: u32,
    exhausted: bool,
    in_flight: bool,
    generation: u32,
}

impl PageCursor {
    pub fn new(page_size: u32) -> Self {
        Self {
            page_index: 0,
            page_size: page_size.max(1),
            exhausted: false,
            in_flight: false,
            generation: 0,
        }
    }

    /// Next page to request.
    pub fn page_index(&self) -> u32 {
        self.page_index
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// True once at least one page has been merged.
    pub fn has_loaded(&self) -> bool {
        self.page_index > 0 || self.exhausted
    }

    /// Starts a fetch. `None` while one is in flight or once exhausted.
    pub fn begin(&mut self) -> Option<PageTicket> {
        if self.in_flight || self.exhausted {
            return None;
        }
        self.in_flight = true;
        Some(PageTicket {
            page: self.page_index,
            size: self.page_size,
            generation: self.generation,
        })
    }

    /// Records a successful fetch of `count` items. Returns `false` for a
    /// stale ticket, in which case the result must be discarded.
    pub fn complete(&mut self, ticket: PageTicket, count: usize) -> bool {
        if ticket.generation != self.generation {
            return false;
        }
        self.in_flight = false;
        self.page_index = ticket.page + 1;
        if count < self.page_size as usize {
            self.exhausted = true;
        }
        true
    }

    /// Records a failed fetch; the same page is requested on retry.
    pub fn fail(&mut self, ticket: PageTicket) -> bool {
        if ticket.generation != self.generation {
            return false;
        }
        self.in_flight = false;
        true
    }

    /// Back to page 0. Any fetch still in flight becomes stale.
    pub fn reset(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.page_index = 0;
        self.exhausted = false;
        self.in_flight = false;
    }
}
