//! Implementations of HasDependencies for std types.
//!
//! Plain values never carry tokens. Containers carry whatever their
//! elements carry.

use crate::{Dependencies, HasDependencies};

macro_rules! no_dependencies {
    ($($type: ty),* $(,)?) => {
        $(impl HasDependencies for $type {})*
    };
}

no_dependencies!(String, &'static str, u8, i8, u16, i16, u32, i32, u64, i64, usize, f32, f64, bool);
no_dependencies!(std::path::PathBuf);

fn merge_all<'a, T: HasDependencies + 'a>(items: impl IntoIterator<Item = &'a T>) -> Dependencies {
    items
        .into_iter()
        .fold(Dependencies::default(), |acc, item| acc.merge(item.dependencies()))
}

impl<T: HasDependencies> HasDependencies for Vec<T> {
    fn dependencies(&self) -> Dependencies {
        merge_all(self)
    }
}

impl<T: HasDependencies> HasDependencies for Option<T> {
    fn dependencies(&self) -> Dependencies {
        merge_all(self)
    }
}

impl<K, V: HasDependencies> HasDependencies for std::collections::BTreeMap<K, V> {
    fn dependencies(&self) -> Dependencies {
        merge_all(self.values())
    }
}

impl<K, V: HasDependencies> HasDependencies for std::collections::HashMap<K, V> {
    fn dependencies(&self) -> Dependencies {
        merge_all(self.values())
    }
}
