//! Loading factors from tab-separated text.
//!
//! Each record holds a probability weight followed by one domain token per column:
//!
//! ```text
//! 0.27	t	t
//! 0.03	t	f
//! ```
//!
//! Records that repeat a key add their weights together, so raw observation counts can be loaded
//! and then passed through [`Factorize::normal`][crate::Factorize::normal].

use crate::density::Density;
use crate::error::{FactorError, Result};
use crate::factor::Factor;
use crate::factorize::cross_reference;
use crate::log_sum_of_logs;
use crate::storage::StorageKind;
use crate::variable::EnumVariable;
use csv_core::{ReadFieldResult, ReaderBuilder};
use smallvec::SmallVec;
use std::io;
use std::str;

/// Reads a factor over `columns` from tab-separated records.
///
/// The columns may be listed in any order; it only has to match the order of the tokens in each
/// record. With no columns, every record holds just a weight and they all add up in the single
/// cell of an atomic factor.
///
/// ```
/// use factor_tables::{tsv, EnumVariable, Factor, StorageKind};
///
/// let a = EnumVariable::new(0, "A", &["t", "f"]).unwrap();
/// let b = EnumVariable::new(1, "B", &["t", "f"]).unwrap();
///
/// let data = "0.2\tt\tf\n0.3\tf\tt\n0.1\tt\tf\n";
/// let f: Factor = tsv::read_factor(data.as_bytes(), &[b.clone(), a.clone()], StorageKind::Dense)
///     .unwrap();
///
/// // The first column is B, so "t f" is B=t, A=f.
/// assert!((f.probability(&[1, 0]).unwrap() - 0.3).abs() < 1e-12);
/// assert!((f.probability(&[0, 1]).unwrap() - 0.3).abs() < 1e-12);
/// assert_eq!(f.occupied(), 2);
/// ```
pub fn read_factor<R: io::Read, D: Density>(
    mut input: R,
    columns: &[EnumVariable],
    kind: StorageKind,
) -> Result<Factor<D>> {
    let mut factor = Factor::with_storage(columns, kind)?;
    if factor.enum_vars().len() != columns.len() {
        return Err(FactorError::schema(format!(
            "columns {:?} name some variable more than once",
            columns
        )));
    }
    let positions = cross_reference(columns, factor.enum_vars());

    let mut inputbuf = [0; 16384];
    let mut fieldbuf = [0; 1024];
    let mut fieldlen = 0;
    let mut weight = None;
    let mut key: SmallVec<[usize; 8]> = SmallVec::from_elem(0, columns.len());
    let mut column = 0;
    let mut line = 1;
    let mut tsv = ReaderBuilder::new().delimiter(b'\t').build();

    loop {
        let read = input.read(&mut inputbuf)?;
        let mut bytes = &inputbuf[..read];
        loop {
            let (result, nin, nout) = tsv.read_field(bytes, &mut fieldbuf[fieldlen..]);
            bytes = &bytes[nin..];
            fieldlen += nout;
            match result {
                ReadFieldResult::InputEmpty => break,
                ReadFieldResult::OutputFull => {
                    return Err(parse_error(line, "field too long"));
                }
                ReadFieldResult::Field { record_end } => {
                    let field = str::from_utf8(&fieldbuf[..fieldlen])
                        .map_err(|e| parse_error(line, e))?;
                    fieldlen = 0;

                    if weight.is_none() {
                        weight = Some(parse_weight(line, field)?);
                    } else if column < columns.len() {
                        let variable = &columns[column];
                        let value = variable.index_of(field).ok_or_else(|| {
                            parse_error(line, format!("{} has no value {:?}", variable, field))
                        })?;
                        if let Some(p) = positions[column] {
                            key[p] = value;
                        }
                        column += 1;
                    } else {
                        return Err(parse_error(
                            line,
                            format!("expected {} fields", columns.len() + 1),
                        ));
                    }

                    if record_end {
                        if column != columns.len() {
                            return Err(parse_error(
                                line,
                                format!("expected {} fields, found {}", columns.len() + 1, column + 1),
                            ));
                        }
                        if let Some(w) = weight.take() {
                            add_weight(&mut factor, &key, w)?;
                        }
                        column = 0;
                        line += 1;
                    }
                }
                ReadFieldResult::End => {
                    tracing::debug!(
                        cells = factor.size(),
                        occupied = factor.occupied(),
                        records = line - 1,
                        "loaded factor"
                    );
                    return Ok(factor);
                }
            }
        }
    }
}

fn parse_error(line: u64, message: impl ToString) -> FactorError {
    FactorError::Parse {
        line,
        message: message.to_string(),
    }
}

fn parse_weight(line: u64, field: &str) -> Result<f64> {
    match field.trim().parse::<f64>() {
        Ok(w) if w >= 0.0 && w.is_finite() => Ok(w),
        Ok(w) => Err(parse_error(line, format!("weight {} is not a probability", w))),
        Err(e) => Err(parse_error(line, format!("weight {:?}: {}", field, e))),
    }
}

fn add_weight<D: Density>(factor: &mut Factor<D>, key: &[usize], weight: f64) -> Result<()> {
    if factor.is_atomic() {
        let total = log_sum_of_logs(factor.atomic_value()?, weight.ln());
        factor.set_atomic_value(total)
    } else {
        let total = log_sum_of_logs(factor.value_by_key(key)?, weight.ln());
        factor.set_value_by_key(key, total)
    }
}
