// Keys waiting for the aggregation window to expire. The timer itself lives with the manager since it needs a handle
// to it to flush; this is only the buffer and the slicing.
#[derive(Debug, Default)]
pub(crate) struct Aggregator {
    buffer: Vec<String>,
}

impl Aggregator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push<I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.buffer.extend(keys);
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Empty the buffer into bunches of at most `bunch_size` keys, in submission order. The last bunch takes the
    /// residue.
    pub(crate) fn drain_bunches(&mut self, bunch_size: usize) -> Vec<Vec<String>> {
        let bunch_size = bunch_size.max(1);
        let mut bunches = Vec::with_capacity(self.buffer.len().div_ceil(bunch_size));
        let mut keys = std::mem::take(&mut self.buffer).into_iter().peekable();

        while keys.peek().is_some() {
            bunches.push(keys.by_ref().take(bunch_size).collect());
        }

        bunches
    }
}
