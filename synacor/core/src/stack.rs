use crate::{CoreError, Result};

/// First allocation, in words (one 4 KiB page of u16s).
pub const INITIAL_ALLOC: usize = 4096 / std::mem::size_of::<u16>();

/// Operand stack backing `push`/`pop`/`call`/`ret`.
///
/// `alloc` is the logical capacity and only ever grows by doubling; `depth <= alloc`
/// holds at all times.
#[derive(Debug, Clone, Default)]
pub struct Stack {
    words: Vec<u16>,
    alloc: usize,
}

impl PartialEq for Stack {
    fn eq(&self, other: &Self) -> bool {
        self.words == other.words
    }
}

impl Eq for Stack {}

impl Stack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a stack from saved contents, bottom first.
    pub fn from_words(words: Vec<u16>) -> Self {
        let alloc = words.len();
        Self { words, alloc }
    }

    pub fn push(&mut self, value: u16) -> Result<()> {
        if self.words.len() == self.alloc {
            let next = if self.alloc == 0 {
                INITIAL_ALLOC
            } else {
                self.alloc * 2
            };
            self.words
                .try_reserve_exact(next - self.words.len())
                .map_err(|_| CoreError::Alloc { words: next })?;
            self.alloc = next;
        }
        self.words.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<u16> {
        self.words.pop()
    }

    pub fn depth(&self) -> usize {
        self.words.len()
    }

    pub fn alloc(&self) -> usize {
        self.alloc
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn as_slice(&self) -> &[u16] {
        &self.words
    }

    pub fn clear(&mut self) {
        self.words.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_push_allocates_one_page() {
        let mut stack = Stack::new();
        assert_eq!(stack.alloc(), 0);
        stack.push(7).unwrap();
        assert_eq!(stack.alloc(), 2048);
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn grows_by_doubling() {
        let mut stack = Stack::new();
        for value in 0..=2048u16 {
            stack.push(value).unwrap();
        }
        assert_eq!(stack.depth(), 2049);
        assert_eq!(stack.alloc(), 4096);
        assert!(stack.depth() <= stack.alloc());
    }

    #[test]
    fn pop_is_lifo_and_empty_pop_is_none() {
        let mut stack = Stack::new();
        stack.push(1).unwrap();
        stack.push(2).unwrap();
        assert_eq!(stack.pop(), Some(2));
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn restored_stack_grows_from_its_depth() {
        let mut stack = Stack::from_words(vec![1, 2, 3]);
        assert_eq!(stack.alloc(), 3);
        stack.push(4).unwrap();
        assert_eq!(stack.alloc(), 6);
        assert_eq!(stack.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn clear_keeps_capacity() {
        let mut stack = Stack::new();
        stack.push(1).unwrap();
        stack.clear();
        assert!(stack.is_empty());
        assert_eq!(stack.alloc(), 2048);
    }
}
