// SPDX-License-Identifier: MPL-2.0

#![allow(unused)]

pub(crate) use std::sync::{Arc, Weak};

pub(crate) use log::{debug, error, info, trace, warn};

pub(crate) use crate::{
    error::{Errno, Error, Result},
    return_errno, return_errno_with_message,
};
