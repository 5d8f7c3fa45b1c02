pub mod interner {
    use std::fmt::{Debug, Display};

    //pub type StringSymbol = lasso::LargeSpur;
    #[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
    pub struct StringSymbol {
        internal: usize,
    }

    pub type IStr = StringSymbol;

    unsafe impl lasso::Key for StringSymbol {
        fn into_usize(self) -> usize {
            self.internal
        }

        fn try_from_usize(int: usize) -> Option<Self> {
            Some(StringSymbol { internal: int })
        }
    }

    impl Display for StringSymbol {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.resolve())
        }
    }

    impl Debug for StringSymbol {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "S('{}')", self.resolve())
        }
    }

    lazy_static! {
        // symbols outlive every registry, so the interner is shared by the whole process
        static ref INTERNER: lasso::ThreadedRodeo<StringSymbol> = lasso::ThreadedRodeo::new();
    }

    pub fn intern(v: &str) -> StringSymbol {
        INTERNER.get_or_intern(v)
    }

    pub trait Internable {
        fn intern(&self) -> IStr;
    }

    impl Internable for str {
        fn intern(&self) -> IStr {
            intern(self)
        }
    }

    impl Internable for String {
        fn intern(&self) -> IStr {
            intern(self.as_str())
        }
    }

    pub trait SpurHelper {
        fn resolve(&self) -> &'static str;
    }

    impl SpurHelper for StringSymbol {
        fn resolve(&self) -> &'static str {
            INTERNER.resolve(self)
        }
    }
}

/// Rounds `value` up to the next multiple of `align`.
///
/// An alignment of 0 or 1 leaves the value untouched.
pub fn align_to(value: u64, align: u64) -> u64 {
    if align <= 1 {
        value
    } else {
        ((value + align - 1) / align) * align
    }
}
