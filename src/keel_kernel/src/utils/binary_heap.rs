//! Binary min-heap with a contextful comparator.
//!
//! The sift routines are modeled after the Rust standard library's
//! `BinaryHeap`. The comparator receives a context value so that the
//! ordering can depend on external state, such as the current tick count.
use core::{mem::ManuallyDrop, ops, ptr};

/// Comparator context for [`BinaryHeap`]'s operations.
pub(crate) trait BinaryHeapCtx<Element> {
    /// Return `true` iff `x < y`.
    fn lt(&mut self, x: &Element, y: &Element) -> bool;
}

impl<T: Ord> BinaryHeapCtx<T> for () {
    fn lt(&mut self, x: &T, y: &T) -> bool {
        *x < *y
    }
}

/// Growable array types backing a [`BinaryHeap`].
pub(crate) trait VecLike: ops::Deref<Target = [<Self as VecLike>::Element]> + ops::DerefMut {
    type Element;
    fn len(&self) -> usize;
    fn pop(&mut self) -> Option<Self::Element>;
    fn push(&mut self, x: Self::Element);
}

impl<T, const N: usize> VecLike for arrayvec::ArrayVec<T, N> {
    type Element = T;
    fn len(&self) -> usize {
        self.len()
    }
    fn pop(&mut self) -> Option<Self::Element> {
        self.pop()
    }
    fn push(&mut self, x: Self::Element) {
        self.push(x)
    }
}

#[cfg(test)]
impl<T> VecLike for std::vec::Vec<T> {
    type Element = T;
    fn len(&self) -> usize {
        self.len()
    }
    fn pop(&mut self) -> Option<Self::Element> {
        self.pop()
    }
    fn push(&mut self, x: Self::Element) {
        self.push(x)
    }
}

/// Min-heap operations on a [`VecLike`].
pub(crate) trait BinaryHeap: VecLike {
    /// Remove the least item from the heap and return it.
    fn heap_pop(&mut self, ctx: impl BinaryHeapCtx<Self::Element>) -> Option<Self::Element>;

    /// Remove the item at the specified position and return it.
    fn heap_remove(
        &mut self,
        i: usize,
        ctx: impl BinaryHeapCtx<Self::Element>,
    ) -> Option<Self::Element>;

    /// Push an item onto the heap.
    fn heap_push(&mut self, item: Self::Element, ctx: impl BinaryHeapCtx<Self::Element>);
}

impl<T: VecLike> BinaryHeap for T {
    fn heap_pop(&mut self, ctx: impl BinaryHeapCtx<Self::Element>) -> Option<Self::Element> {
        self.heap_remove(0, ctx)
    }

    fn heap_remove(
        &mut self,
        i: usize,
        mut ctx: impl BinaryHeapCtx<Self::Element>,
    ) -> Option<Self::Element> {
        if i >= self.len() {
            return None;
        }

        // Swap the last item into the vacated slot, then restore the heap
        // invariant by sifting it in whichever direction is violated.
        if let Some(mut item) = self.pop() {
            let slice = &mut **self;
            if i < slice.len() {
                core::mem::swap(&mut slice[i], &mut item);

                let should_sift_up = i > 0 && ctx.lt(&slice[i], &slice[(i - 1) / 2]);

                // Safety: `i` points to an element within `slice`.
                unsafe {
                    if should_sift_up {
                        sift_up(slice, i, ctx);
                    } else {
                        sift_down(slice, i, ctx);
                    }
                }
            }
            Some(item)
        } else {
            debug_assert!(false);
            None
        }
    }

    fn heap_push(&mut self, item: Self::Element, ctx: impl BinaryHeapCtx<Self::Element>) {
        let i = self.len();
        self.push(item);

        let slice = &mut **self;

        // Safety: `i` points to an element within `slice`.
        unsafe { sift_up(slice, i, ctx) };
    }
}

/// Hole represents an index in a slice without a valid value (because the
/// value was moved out). On drop, `Hole` restores the slice by filling the
/// hole position with the value that was originally removed.
struct Hole<'a, T: 'a> {
    data: &'a mut [T],
    elt: ManuallyDrop<T>,
    pos: usize,
}

impl<'a, T> Hole<'a, T> {
    /// # Safety
    ///
    /// `pos` must be within the slice.
    unsafe fn new(data: &'a mut [T], pos: usize) -> Self {
        debug_assert!(pos < data.len());
        let elt = unsafe { ptr::read(data.get_unchecked(pos)) };
        Hole {
            data,
            elt: ManuallyDrop::new(elt),
            pos,
        }
    }

    fn element(&self) -> &T {
        &self.elt
    }

    /// # Safety
    ///
    /// `index` must be within the slice and not equal to the hole position.
    unsafe fn get(&self, index: usize) -> &T {
        debug_assert!(index != self.pos);
        debug_assert!(index < self.data.len());
        unsafe { self.data.get_unchecked(index) }
    }

    /// Move the hole to a new location.
    ///
    /// # Safety
    ///
    /// `index` must be within the slice and not equal to the hole position.
    unsafe fn move_to(&mut self, index: usize) {
        debug_assert!(index != self.pos);
        debug_assert!(index < self.data.len());
        unsafe {
            let index_ptr: *const _ = self.data.get_unchecked(index);
            let hole_ptr = self.data.get_unchecked_mut(self.pos);
            ptr::copy_nonoverlapping(index_ptr, hole_ptr, 1);
        }
        self.pos = index;
    }
}

impl<T> Drop for Hole<'_, T> {
    fn drop(&mut self) {
        // fill the hole again
        unsafe {
            let pos = self.pos;
            ptr::copy_nonoverlapping(&*self.elt, self.data.get_unchecked_mut(pos), 1);
        }
    }
}

/// # Safety
///
/// `pos` must point to an element within `this`.
unsafe fn sift_up<Element>(this: &mut [Element], pos: usize, mut ctx: impl BinaryHeapCtx<Element>) {
    unsafe {
        let mut hole = Hole::new(this, pos);

        while hole.pos > 0 {
            let parent = (hole.pos - 1) / 2;
            if !ctx.lt(hole.element(), hole.get(parent)) {
                break;
            }
            hole.move_to(parent);
        }
    }
}

/// Take the element at `pos` and move it down the heap while its children
/// are smaller.
///
/// # Safety
///
/// `pos` must point to an element within `this`.
unsafe fn sift_down<Element>(
    this: &mut [Element],
    pos: usize,
    mut ctx: impl BinaryHeapCtx<Element>,
) {
    let end = this.len();
    unsafe {
        let mut hole = Hole::new(this, pos);
        let mut child = 2 * pos + 1;
        while child < end {
            let right = child + 1;
            // compare with the lesser of the two children
            if right < end && !ctx.lt(hole.get(child), hole.get(right)) {
                child = right;
            }

            // if we are already in order, stop.
            if !ctx.lt(hole.get(child), hole.element()) {
                break;
            }

            hole.move_to(child);
            child = 2 * hole.pos + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::{vec, vec::Vec};

    /// Orders values by their distance from a fixed origin, in wrapping
    /// `u32` arithmetic. This mirrors how timeout deadlines are compared.
    struct WrapCtx {
        origin: u32,
    }

    impl BinaryHeapCtx<u32> for WrapCtx {
        fn lt(&mut self, x: &u32, y: &u32) -> bool {
            x.wrapping_sub(self.origin) < y.wrapping_sub(self.origin)
        }
    }

    #[test]
    fn push_pop_sorted() {
        let mut heap = Vec::new();
        for x in [5u32, 1, 4, 2, 3, 0, 9, 8] {
            heap.heap_push(x, ());
        }
        let mut out = Vec::new();
        while let Some(x) = heap.heap_pop(()) {
            out.push(x);
        }
        assert_eq!(out, vec![0, 1, 2, 3, 4, 5, 8, 9]);
    }

    #[test]
    fn remove_preserves_invariant() {
        let mut heap = Vec::new();
        for x in [7u32, 3, 9, 1, 5] {
            heap.heap_push(x, ());
        }
        // remove an interior element
        let i = heap.iter().position(|&x| x == 9).unwrap();
        assert_eq!(heap.heap_remove(i, ()), Some(9));
        assert_eq!(heap.heap_remove(100, ()), None);

        let mut out = Vec::new();
        while let Some(x) = heap.heap_pop(()) {
            out.push(x);
        }
        assert_eq!(out, vec![1, 3, 5, 7]);
    }

    #[quickcheck]
    fn pop_order_matches_sort(mut xs: Vec<u32>, origin: u32) -> bool {
        let mut heap = Vec::new();
        for &x in xs.iter() {
            heap.heap_push(x, WrapCtx { origin });
        }

        let mut out = Vec::new();
        while let Some(x) = heap.heap_pop(WrapCtx { origin }) {
            out.push(x);
        }

        xs.sort_by_key(|x| x.wrapping_sub(origin));
        out == xs
    }

    #[quickcheck]
    fn remove_arbitrary(xs: Vec<u32>, removals: Vec<usize>) -> bool {
        let mut heap = Vec::new();
        let mut model = xs.clone();
        for &x in xs.iter() {
            heap.heap_push(x, ());
        }

        for &r in removals.iter() {
            if heap.is_empty() {
                break;
            }
            let i = r % heap.len();
            let removed = heap.heap_remove(i, ()).unwrap();
            let j = model.iter().position(|&x| x == removed).unwrap();
            model.remove(j);
        }

        let mut out = Vec::new();
        while let Some(x) = heap.heap_pop(()) {
            out.push(x);
        }
        model.sort_unstable();
        out == model
    }
}
