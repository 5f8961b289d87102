use std::io::{ErrorKind, Result};

/// Trait to determine whether a status code is an error.
pub(crate) trait IsError {
    /// Determine if this value is an error.
    fn is_error(&self) -> bool;
}

#[cfg(target_family = "unix")]
macro_rules! is_error {
    ($source:ty) => {
        impl IsError for $source {
            #[inline]
            fn is_error(&self) -> bool {
                *self == -1
            }
        }
    };
}

#[cfg(target_family = "windows")]
macro_rules! is_error {
    ($source:ty) => {
        impl IsError for $source {
            #[inline]
            fn is_error(&self) -> bool {
                *self == 0
            }
        }
    };
}

is_error!(i32);
is_error!(isize);
#[cfg(target_family = "windows")]
is_error!(u32);

/// Trait to convert a status code into a Rust result.
pub(crate) trait IntoResult {
    /// The target type.
    type Target;

    /// Convert this status code into a Rust result.
    fn into_result(self) -> Result<Self::Target>;
}

macro_rules! into_result {
    ($source:ty, $target:ty) => {
        impl IntoResult for $source {
            type Target = $target;

            fn into_result(self) -> Result<Self::Target> {
                if self.is_error() {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(self as Self::Target)
                }
            }
        }
    };
}

into_result!(i32, u32);
into_result!(isize, usize);
#[cfg(target_family = "windows")]
into_result!(u32, u32);

/// Invoke the system call until it isn't interrupted by a signal anymore.
#[cfg_attr(target_family = "windows", allow(dead_code))]
pub(crate) fn retry_interrupted<T, F>(mut call: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    loop {
        match call() {
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}

// -------------------------------------------------------------------------------------

/// A newtype to display a string as an identifier.
struct Ident<'a>(&'a str);

impl std::fmt::Debug for Ident<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// A newtype to display the names of set flags as a list of identifiers.
pub(crate) struct FlagList(Vec<&'static str>);

impl FlagList {
    /// Collect the names of all flags set in the value.
    pub fn of<T>(value: T, flags: &[(&'static str, T)]) -> Self
    where
        T: Copy + std::ops::BitAnd<Output = T> + PartialEq + Default,
    {
        Self(
            flags
                .iter()
                .filter(|(_, mask)| value & *mask != T::default())
                .map(|(name, _)| *name)
                .collect(),
        )
    }
}

impl std::fmt::Debug for FlagList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.0.iter().map(|name| Ident(name)))
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::{retry_interrupted, FlagList};
    use std::io::{Error, ErrorKind};

    #[test]
    fn test_retry_interrupted() {
        let mut attempts = 0;
        let result = retry_interrupted(|| {
            attempts += 1;
            if attempts < 3 {
                Err(Error::from(ErrorKind::Interrupted))
            } else {
                Ok(attempts)
            }
        });
        assert_eq!(result.ok(), Some(3));

        let result: std::io::Result<()> =
            retry_interrupted(|| Err(Error::from(ErrorKind::PermissionDenied)));
        assert_eq!(result.map_err(|e| e.kind()), Err(ErrorKind::PermissionDenied));
    }

    #[test]
    fn test_flag_list() {
        let flags = FlagList::of(0b101_u32, &[("A", 0b001), ("B", 0b010), ("C", 0b100)]);
        assert_eq!(format!("{:?}", flags), "[A, C]");
    }
}
