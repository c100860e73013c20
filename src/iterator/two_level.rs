use crate::error::LsmKvError;
use crate::iterator::{BoxedIterator, EmptyIterator, KvIterator};
use crate::Result;

/// Opens the second-level iterator named by an index entry value.
pub trait BlockIterBuilder: Send {
    fn build(&mut self, index_value: &[u8]) -> Result<BoxedIterator>;
}

impl<F> BlockIterBuilder for F
where
    F: FnMut(&[u8]) -> Result<BoxedIterator> + Send,
{
    fn build(&mut self, index_value: &[u8]) -> Result<BoxedIterator> {
        self(index_value)
    }
}

/// Iterates over an index whose values each name a sequence of entries,
/// yielding the concatenation of those sequences. Used for the blocks of
/// a table and for the files of a level.
pub struct TwoLevelIterator<B: BlockIterBuilder> {
    index_iter: BoxedIterator,
    data_iter: Option<BoxedIterator>,
    builder: B,
    /// If `data_iter` is set, then this holds the index value that was
    /// passed to the builder to create it.
    data_block_handle: Vec<u8>,
    /// First error met in a data iterator that has since been dropped.
    status: Option<LsmKvError>,
}

impl<B: BlockIterBuilder> TwoLevelIterator<B> {
    pub fn new(index_iter: BoxedIterator, builder: B) -> TwoLevelIterator<B> {
        TwoLevelIterator {
            index_iter,
            data_iter: None,
            builder,
            data_block_handle: vec![],
            status: None,
        }
    }

    fn set_data_iter(&mut self, data_iter: Option<BoxedIterator>) {
        if let Some(old) = &self.data_iter {
            if self.status.is_none() {
                if let Err(e) = old.status() {
                    self.status = Some(e);
                }
            }
        }
        self.data_iter = data_iter;
    }

    fn init_data_block(&mut self) {
        if !self.index_iter.valid() {
            self.set_data_iter(None);
            return;
        }
        let handle = self.index_iter.value();
        if self.data_iter.is_some() && handle == &self.data_block_handle[..] {
            // data_iter is already constructed with this iterator, so
            // no need to change anything
            return;
        }
        let iter: BoxedIterator = match self.builder.build(handle) {
            Ok(iter) => iter,
            Err(e) => Box::new(EmptyIterator::with_error(e)),
        };
        self.data_block_handle.clear();
        self.data_block_handle.extend_from_slice(handle);
        self.set_data_iter(Some(iter));
    }

    #[inline]
    fn data_valid(&self) -> bool {
        self.data_iter.as_ref().map_or(false, |d| d.valid())
    }

    fn skip_empty_data_blocks_forward(&mut self) {
        while !self.data_valid() {
            // Move to next block
            if !self.index_iter.valid() {
                self.set_data_iter(None);
                return;
            }
            self.index_iter.next();
            self.init_data_block();
            if let Some(d) = self.data_iter.as_mut() {
                d.seek_to_first();
            }
        }
    }

    fn skip_empty_data_blocks_backward(&mut self) {
        while !self.data_valid() {
            // Move to previous block
            if !self.index_iter.valid() {
                self.set_data_iter(None);
                return;
            }
            self.index_iter.prev();
            self.init_data_block();
            if let Some(d) = self.data_iter.as_mut() {
                d.seek_to_last();
            }
        }
    }
}

impl<B: BlockIterBuilder> KvIterator for TwoLevelIterator<B> {
    fn valid(&self) -> bool {
        self.data_valid()
    }

    fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.init_data_block();
        if let Some(d) = self.data_iter.as_mut() {
            d.seek_to_first();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.init_data_block();
        if let Some(d) = self.data_iter.as_mut() {
            d.seek_to_last();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index_iter.seek(target);
        self.init_data_block();
        if let Some(d) = self.data_iter.as_mut() {
            d.seek(target);
        }
        self.skip_empty_data_blocks_forward();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        if let Some(d) = self.data_iter.as_mut() {
            d.next();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        if let Some(d) = self.data_iter.as_mut() {
            d.prev();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn key(&self) -> &[u8] {
        match &self.data_iter {
            Some(d) => d.key(),
            None => &[],
        }
    }

    fn value(&self) -> &[u8] {
        match &self.data_iter {
            Some(d) => d.value(),
            None => &[],
        }
    }

    fn status(&self) -> Result<()> {
        self.index_iter.status()?;
        if let Some(d) = &self.data_iter {
            d.status()?;
        }
        match &self.status {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}
