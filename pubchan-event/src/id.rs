//! Event identifiers.
//!
//! Any hashable value may identify an event, as
//! long as the type knows how to spell the two
//! reserved identifiers:
//!
//! - `all`: a subscriber registered on it receives
//!   every emission, whatever ids were emitted.
//! - `closed`: emitted by the channel itself,
//!   exactly once, right after it is closed.
//!
//! String-like ids spell them `"$all"` and
//! `"$closed"`. Every other id (`"$close"`
//! included) is a plain application convention.

use crate::ordered::OrderedMap;
use std::borrow::{Borrow, Cow};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// Spelling of the wildcard id for string-like ids.
pub const ALL: &str = "$all";

/// Spelling of the closure id for string-like ids.
pub const CLOSED: &str = "$closed";

/// Event identifier trait.
pub trait EventId: Hash + Eq + Clone + fmt::Debug + 'static {
    /// The wildcard identifier.
    fn all() -> Self;

    /// The identifier emitted upon closure.
    fn closed() -> Self;
}

impl EventId for &'static str {
    fn all() -> Self {
        ALL
    }

    fn closed() -> Self {
        CLOSED
    }
}

impl EventId for String {
    fn all() -> Self {
        ALL.to_string()
    }

    fn closed() -> Self {
        CLOSED.to_string()
    }
}

impl EventId for Rc<str> {
    fn all() -> Self {
        Rc::from(ALL)
    }

    fn closed() -> Self {
        Rc::from(CLOSED)
    }
}

struct TokenInner {
    label: Cow<'static, str>,
}

/// Opaque event identifier compared by identity.
///
/// Two tokens are equal only when one is a clone
/// of the other, whatever their labels. This is
/// what function or object identifiers mean: the
/// handle is the identity, the label is only for
/// humans reading logs.
#[derive(Clone)]
pub struct Token {
    inner: Rc<TokenInner>,
}

impl Token {
    pub fn new(label: impl Into<Cow<'static, str>>) -> Self {
        Self {
            inner: Rc::new(TokenInner {
                label: label.into(),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Token {}

impl Hash for Token {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Rc::as_ptr(&self.inner), state)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({}@{:p})", self.label(), Rc::as_ptr(&self.inner))
    }
}

thread_local! {
    static TOKEN_ALL: Token = Token::new(ALL);
    static TOKEN_CLOSED: Token = Token::new(CLOSED);
}

impl EventId for Token {
    fn all() -> Self {
        TOKEN_ALL.with(Token::clone)
    }

    fn closed() -> Self {
        TOKEN_CLOSED.with(Token::clone)
    }
}

/// Possibly nested sequence of event ids.
///
/// Registration and emission both accept any
/// nesting of ids, which is flattened depth-first
/// and left to right.
pub trait IntoIds<K> {
    fn flatten_into(self, out: &mut Vec<K>);
}

impl<K> IntoIds<K> for K
where
    K: EventId,
{
    fn flatten_into(self, out: &mut Vec<K>) {
        out.push(self);
    }
}

impl IntoIds<String> for &str {
    fn flatten_into(self, out: &mut Vec<String>) {
        out.push(self.to_string());
    }
}

impl IntoIds<Rc<str>> for &str {
    fn flatten_into(self, out: &mut Vec<Rc<str>>) {
        out.push(Rc::from(self));
    }
}

impl<K> IntoIds<K> for () {
    fn flatten_into(self, _: &mut Vec<K>) {}
}

impl<K, T> IntoIds<K> for Vec<T>
where
    T: IntoIds<K>,
{
    fn flatten_into(self, out: &mut Vec<K>) {
        for ids in self {
            ids.flatten_into(out);
        }
    }
}

impl<K, T, const N: usize> IntoIds<K> for [T; N]
where
    T: IntoIds<K>,
{
    fn flatten_into(self, out: &mut Vec<K>) {
        for ids in self {
            ids.flatten_into(out);
        }
    }
}

macro_rules! impl_into_ids_tuple {
    ($($name:ident),+) => {
        impl<K, $($name),+> IntoIds<K> for ($($name,)+)
        where
            $($name: IntoIds<K>,)+
        {
            #[allow(non_snake_case)]
            fn flatten_into(self, out: &mut Vec<K>) {
                let ($($name,)+) = self;
                $($name.flatten_into(out);)+
            }
        }
    };
}

impl_into_ids_tuple!(T1, T2);
impl_into_ids_tuple!(T1, T2, T3);
impl_into_ids_tuple!(T1, T2, T3, T4);

/// Read-only set of emitted ids.
///
/// Handed to every callback of an emission so it
/// can test which ids fired. Duplicates are folded
/// and the first-emitted order is kept.
pub struct IdSet<K>
where
    K: EventId,
{
    ids: OrderedMap<K, ()>,
}

impl<K> IdSet<K>
where
    K: EventId,
{
    pub fn from_ids<I>(ids: I) -> Self
    where
        I: IntoIds<K>,
    {
        let mut flat = Vec::new();
        ids.flatten_into(&mut flat);
        let mut set = OrderedMap::new();
        for id in flat {
            set.insert(id, ());
        }
        Self { ids: set }
    }

    pub fn contains<Q>(&self, id: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.ids.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &K> {
        self.ids.keys()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl<K> fmt::Debug for IdSet<K>
where
    K: EventId,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
