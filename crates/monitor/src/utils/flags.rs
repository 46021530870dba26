//! A small library to parse command-line and environmental flags.
//!
//! Flags are grouped by a marker type (`FlagsOf<T>`) so that independent components can
//! register flags with the same name without clashing. Registration happens before `main`
//! through `ctor`, see [`define_flag!`](crate::define_flag).

use std::{any::TypeId, borrow::Cow, fmt};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlagType {
    Boolean,
    Isize,
    Usize,
    F64,
}

/// Value types that can be stored in a flag.
pub trait FlagValue: Copy + Send + 'static {
    const TYPE: FlagType;

    fn parse_flag(argument: &str) -> Option<Self>;
}

impl FlagValue for bool {
    const TYPE: FlagType = FlagType::Boolean;

    fn parse_flag(argument: &str) -> Option<Self> {
        match argument {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        }
    }
}

fn split_radix(argument: &str) -> (&str, u32) {
    let len = argument.len();

    if len > 2 && &argument[0..2] == "0x" {
        (&argument[2..], 16)
    } else if len > 1 && &argument[0..1] == "0" {
        (&argument[1..], 8)
    } else {
        (argument, 10)
    }
}

impl FlagValue for usize {
    const TYPE: FlagType = FlagType::Usize;

    fn parse_flag(argument: &str) -> Option<Self> {
        let (digits, radix) = split_radix(argument);
        usize::from_str_radix(digits, radix).ok()
    }
}

impl FlagValue for isize {
    const TYPE: FlagType = FlagType::Isize;

    fn parse_flag(argument: &str) -> Option<Self> {
        let (negative, argument) = match argument.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, argument),
        };
        let (digits, radix) = split_radix(argument);
        let value = isize::from_str_radix(digits, radix).ok()?;
        Some(if negative { -value } else { value })
    }
}

impl FlagValue for f64 {
    const TYPE: FlagType = FlagType::F64;

    fn parse_flag(argument: &str) -> Option<Self> {
        argument.parse::<f64>().ok()
    }
}

/// Stores a string argument into a flag. Returns `false` when the argument is not a
/// valid value for the flag.
pub type FlagSetter = fn(&str) -> bool;

struct Flag {
    name: &'static str,
    comment: &'static str,
    short: Option<&'static str>,
    typ: FlagType,
    is_set: bool,
    setter: FlagSetter,
}

struct FlagGroup {
    type_id: TypeId,
    type_name: &'static str,
    flags: Vec<Flag>,
    initialized: bool,
}

static FLAGS: Mutex<Vec<FlagGroup>> = Mutex::new(Vec::new());

fn with_group<T: 'static, R>(f: impl FnOnce(&mut FlagGroup) -> R) -> R {
    let mut groups = FLAGS.lock();
    let key = TypeId::of::<T>();
    let ix = match groups.iter().position(|group| group.type_id == key) {
        Some(ix) => ix,
        None => {
            groups.push(FlagGroup {
                type_id: key,
                type_name: std::any::type_name::<T>(),
                flags: Vec::new(),
                initialized: false,
            });
            groups.len() - 1
        }
    };

    f(&mut groups[ix])
}

fn try_with_group<T: 'static, R>(f: impl FnOnce(&mut FlagGroup) -> R) -> Option<R> {
    let mut groups = FLAGS.lock();
    let key = TypeId::of::<T>();
    groups
        .iter_mut()
        .find(|group| group.type_id == key)
        .map(f)
}

/// Description of a registered flag, used for `--help` style listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagInfo {
    pub name: &'static str,
    pub comment: &'static str,
    pub short: Option<&'static str>,
    pub typ: FlagType,
    pub is_set: bool,
}

pub struct FlagsOf<T>(std::marker::PhantomData<T>);

impl<T: 'static> FlagsOf<T> {
    pub fn is_set(name: &str) -> bool {
        try_with_group::<T, _>(|group| {
            group
                .flags
                .iter()
                .any(|flag| flag.name == name && flag.is_set)
        })
        .unwrap_or(false)
    }

    /// All flags registered for `T`, sorted by name.
    pub fn describe() -> Vec<FlagInfo> {
        let mut infos = try_with_group::<T, _>(|group| {
            group
                .flags
                .iter()
                .map(|flag| FlagInfo {
                    name: flag.name,
                    comment: flag.comment,
                    short: flag.short,
                    typ: flag.typ,
                    is_set: flag.is_set,
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
        infos.sort_by(|a, b| compare_flag_names(a.name, b.name));
        infos
    }

    fn set_flag_from_string(name: &str, short: bool, argument: &str) -> Result<(), FlagError> {
        // Look the setter up first: it takes the storage lock of the flag itself, never
        // the registry lock.
        let setter = try_with_group::<T, _>(|group| {
            group
                .flags
                .iter()
                .find(|flag| {
                    if short {
                        flag.short == Some(name)
                    } else {
                        flag.name == name
                    }
                })
                .map(|flag| (flag.name, flag.setter))
        })
        .flatten();

        let Some((flag_name, setter)) = setter else {
            return Err(FlagError::FlagNotFound(name.to_owned()));
        };

        if !setter(argument) {
            log::warn!(
                target: "vmkit::flags",
                "Ignoring flag: {} is an invalid value for flag {}",
                argument,
                flag_name
            );
            return Ok(());
        }

        try_with_group::<T, _>(|group| {
            if let Some(flag) = group.flags.iter_mut().find(|flag| flag.name == flag_name) {
                flag.is_set = true;
            }
        });

        Ok(())
    }

    fn parse<const SHORT: bool>(option: &str) -> Result<(), FlagError> {
        let equals_pos = option.find('=');

        let (name, argument) = match equals_pos {
            Some(equals_pos) => (&option[..equals_pos], &option[equals_pos + 1..]),
            None => {
                if let Some(rest) = option
                    .strip_prefix("no_")
                    .or_else(|| option.strip_prefix("no-"))
                {
                    (rest, "false")
                } else {
                    (option, "true")
                }
            }
        };

        let name = name.replace('-', "_");
        Self::set_flag_from_string(&name, SHORT, argument)
    }

    fn process_command_line_flags(
        prefix: Option<&str>,
        flags: impl Iterator<Item = String>,
    ) -> Result<(), FlagError> {
        let mut flags_vec = flags.collect::<Vec<String>>();
        flags_vec.sort_by(|a, b| compare_flag_names(a, b));

        let long_prefix = prefix
            .map(|prefix| Cow::Owned(format!("--{}:", prefix)))
            .unwrap_or(Cow::Borrowed("--"));
        let short_prefix = prefix
            .map(|prefix| Cow::Owned(format!("-{}:", prefix)))
            .unwrap_or(Cow::Borrowed("-"));

        for flag in flags_vec.iter() {
            if is_valid_flag(flag, &long_prefix) {
                Self::parse::<false>(&flag[long_prefix.len()..])?;
            } else if is_valid_flag(flag, &short_prefix) {
                Self::parse::<true>(&flag[short_prefix.len()..])?;
            }
        }

        with_group::<T, _>(|group| group.initialized = true);
        Ok(())
    }

    fn process_environmental_vars(
        prefix: Option<&str>,
        vars: impl Iterator<Item = (String, String)>,
    ) {
        let env_prefix = prefix
            .map(|prefix| format!("{}_", prefix.to_uppercase()))
            .unwrap_or_default();

        for (option, argument) in vars {
            let Some(name) = option.strip_prefix(env_prefix.as_str()) else {
                continue;
            };
            // unknown variables are someone else's business
            let _ = Self::set_flag_from_string(&name.to_lowercase(), false, &argument);
        }
    }

    fn parse_all(
        prefix: Option<&str>,
        args: impl Iterator<Item = String>,
        env: impl Iterator<Item = (String, String)>,
    ) -> Result<(), FlagError> {
        match try_with_group::<T, _>(|group| (group.initialized, group.type_name)) {
            None => Err(FlagError::NoFlags(std::any::type_name::<T>())),
            Some((true, type_name)) => Err(FlagError::FlagsAlreadyInitialized(type_name)),
            Some((false, _)) => {
                Self::process_environmental_vars(prefix, env);
                Self::process_command_line_flags(prefix, args)
            }
        }
    }
}

fn is_valid_flag(name: &str, prefix: &str) -> bool {
    name.len() > prefix.len() && &name[0..prefix.len()] == prefix
}

fn compare_flag_names(left: &str, right: &str) -> std::cmp::Ordering {
    left.cmp(right)
}

/// Parse `--name=value` style arguments and `NAME=value` environment variables for the
/// flags registered under `T`. Can only be done once per flag group.
pub fn parse<T: 'static>(
    args: impl Iterator<Item = String>,
    env: impl Iterator<Item = (String, String)>,
) -> Result<(), FlagError> {
    FlagsOf::<T>::parse_all(None, args, env)
}

/// Same as [`parse`] but arguments look like `--prefix:name=value` and environment variables
/// like `PREFIX_NAME=value`.
pub fn parse_with_prefix<T: 'static>(
    prefix: &str,
    args: impl Iterator<Item = String>,
    env: impl Iterator<Item = (String, String)>,
) -> Result<(), FlagError> {
    FlagsOf::<T>::parse_all(Some(prefix), args, env)
}

#[doc(hidden)]
pub fn register<T: 'static, V: FlagValue>(
    name: &'static str,
    comment: &'static str,
    short: Option<&'static str>,
    setter: FlagSetter,
) {
    with_group::<T, _>(|group| {
        if group.flags.iter().any(|flag| flag.name == name) {
            return;
        }

        group.flags.push(Flag {
            name,
            comment,
            short,
            typ: V::TYPE,
            is_set: false,
            setter,
        });
    })
}

#[doc(hidden)]
pub use ctor::ctor;
#[doc(hidden)]
pub use paste;

/// Define a flag stored in a static, registered under the marker type `$of`.
///
/// Generates `<of>_<name>()` returning the current value, `set_<of>_<name>(value)` and
/// `is_<of>_<name>_set()`.
#[macro_export]
macro_rules! define_flag {
    ($of: ident => $typ: ty, $name: ident, $default_value: expr, $comment: literal) => {
        $crate::define_flag!(@impl $of => $typ, $name, None, $default_value, $comment);
    };

    ($of: ident => $typ: ty, $name: ident, $short: literal, $default_value: expr, $comment: literal) => {
        $crate::define_flag!(@impl $of => $typ, $name, Some($short), $default_value, $comment);
    };

    (@impl $of: ident => $typ: ty, $name: ident, $short: expr, $default_value: expr, $comment: literal) => {
        paste::paste! {
            static [<$of:upper _FLAG_ $name:upper>]: parking_lot::Mutex<Option<$typ>> =
                parking_lot::Mutex::new(None);

            #[doc(hidden)]
            #[ctor::ctor]
            fn [<init_ $of:lower _ $name _flag>]() {
                $crate::utils::flags::register::<$of, $typ>(
                    stringify!($name),
                    $comment,
                    $short,
                    |argument| {
                        match <$typ as $crate::utils::flags::FlagValue>::parse_flag(argument) {
                            Some(value) => {
                                *[<$of:upper _FLAG_ $name:upper>].lock() = Some(value);
                                true
                            }
                            None => false,
                        }
                    },
                );
            }

            #[doc = $comment]
            pub fn [<$of:lower _ $name>]() -> $typ {
                let value = *[<$of:upper _FLAG_ $name:upper>].lock();
                value.unwrap_or_else(|| $default_value)
            }

            pub fn [<set_ $of:lower _ $name>]($name: $typ) {
                *[<$of:upper _FLAG_ $name:upper>].lock() = Some($name);
            }

            pub fn [<is_ $of:lower _ $name _set>]() -> bool {
                $crate::utils::flags::FlagsOf::<$of>::is_set(stringify!($name))
            }
        }
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagError {
    FlagNotFound(String),
    FlagsAlreadyInitialized(&'static str),
    NoFlags(&'static str),
}

impl fmt::Display for FlagError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FlagNotFound(name) => write!(f, "unknown flag: {}", name),
            Self::FlagsAlreadyInitialized(group) => {
                write!(f, "flags of {} were already parsed", group)
            }
            Self::NoFlags(group) => write!(f, "no flags registered for {}", group),
        }
    }
}

impl std::error::Error for FlagError {}
