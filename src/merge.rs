//! Assembly of the single band files into the final output.
//!
//! The merged file starts from the source granule's global attributes, with
//! provenance appended to `history` (or `History`) and `history_json`. Then
//! come the `time` dimension and variable if the source has them, the
//! metadata variables copied verbatim, each reprojected science variable
//! with its source attributes, and finally the grid-mapping and dimension
//! variables from the single band files, each copied once.
//!
//! Nothing is written until the whole output has been assembled.
use std::{collections::BTreeSet, io, path::Path};

use error_stack::ResultExt;
use indexmap::IndexMap;
use ndarray::{ArrayD, IxDyn};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{
    config::ProvenanceConfig,
    dataset::{split_path, AttrValue, Dataset, DatasetIo, ScaleOffset, Variable},
    error::ReprojectError,
    nc_utils::NcArray,
    parameters::RequestParameters,
    single_band::variable_file_path,
    variables::VarInfo,
};

const TIME: &str = "time";

/// Compact JSON with a space after every `,` and `:`, the layout used in
/// `history` lines written by other tools in the processing chain.
struct SpacedFormatter;

impl serde_json::ser::Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}

pub(crate) fn to_spaced_json(value: &Value) -> Result<String, serde_json::Error> {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, SpacedFormatter);
    value.serialize(&mut ser)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Merge the single band files of `science_variables` into `output_file`.
///
/// Every science variable listed must have a single band file in
/// `temp_dir`; a missing one is an error, as it means the list and the
/// files are out of step.
#[allow(clippy::too_many_arguments)]
pub fn create_output(
    parameters: &RequestParameters,
    output_file: &Path,
    temp_dir: &Path,
    science_variables: &[String],
    metadata_variables: &BTreeSet<String>,
    var_info: &VarInfo,
    io: &dyn DatasetIo,
    provenance: &ProvenanceConfig,
    deflate_level: i32,
) -> error_stack::Result<(), ReprojectError> {
    log::info!("Creating output file \"{}\"", output_file.display());
    let input = var_info.dataset();
    let mut output = Dataset::new();

    log::info!("Copying input file attributes to output file.");
    let date_time = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false);
    let attributes = output_attributes(input, parameters, provenance, &date_time)?;
    output.set_attributes(attributes);

    if let Some(time_len) = input.dimension_len(TIME) {
        log::info!("Adding \"time\" dimension.");
        output.add_dimension(TIME, time_len);
        if input.contains_variable(TIME) {
            copy_metadata_variable(input, &mut output, TIME, deflate_level)?;
        }
    }

    for variable in metadata_variables {
        copy_metadata_variable(input, &mut output, variable, deflate_level)?;
    }

    let extension = parameters.input_extension();
    for variable in science_variables {
        let band_file = variable_file_path(temp_dir, variable, &extension);
        if !io.exists(&band_file) {
            log::error!("Cannot find \"{}\".", band_file.display());
            return Err(ReprojectError::MissingReprojectedData(variable.clone()).into());
        }
        let single_band = io
            .read(&band_file)
            .change_context_lazy(|| ReprojectError::MissingReprojectedData(variable.clone()))?;

        for (name, &len) in single_band.root().dimensions() {
            if !output.has_dimension(name) {
                output.add_dimension(name, len);
            }
        }

        copy_science_variable(input, &mut output, &single_band, variable, var_info, deflate_level)?;

        for path in single_band.variable_paths() {
            if !output.contains_variable(&path) && !same_path(&path, variable) {
                copy_metadata_variable(&single_band, &mut output, &path, deflate_level)?;
            }
        }
    }

    io.write(output_file, &output)
        .change_context_lazy(|| {
            ReprojectError::context(format!("writing {}", output_file.display()))
        })
}

fn same_path(a: &str, b: &str) -> bool {
    a.trim_start_matches('/') == b.trim_start_matches('/')
}

/// The global attributes of the output: the source's, with this run's
/// provenance added.
fn output_attributes(
    input: &Dataset,
    parameters: &RequestParameters,
    provenance: &ProvenanceConfig,
    date_time: &str,
) -> error_stack::Result<IndexMap<String, AttrValue>, ReprojectError> {
    let mut attributes = input.attributes().clone();

    let cf_att_name = if input.attribute("History").is_some() {
        "History"
    } else {
        "history"
    };
    let input_history = input.attribute(cf_att_name).and_then(|a| a.as_string());

    let record = history_record(input_history.as_deref(), parameters, provenance, date_time);

    let mut history_json = match input.attribute("history_json").and_then(|a| a.as_string()) {
        Some(existing) => {
            match serde_json::from_str::<Value>(&existing).change_context_lazy(|| {
                ReprojectError::context("parsing the input history_json attribute")
            })? {
                Value::Array(records) => records,
                single => vec![single],
            }
        }
        None => vec![],
    };

    let mut line_parameters = parameters.history_parameters();
    line_parameters.remove("input_file");
    let history_line = format!(
        "{date_time} {} {} {}",
        provenance.program,
        provenance.version,
        to_spaced_json(&Value::Object(line_parameters))
            .change_context_lazy(|| ReprojectError::context("serializing history parameters"))?
    );

    history_json.push(Value::Object(record));
    let history_json = to_spaced_json(&Value::Array(history_json))
        .change_context_lazy(|| ReprojectError::context("serializing history_json"))?;
    attributes.insert("history_json".to_string(), history_json.into());

    let history = match input_history {
        Some(h) if !h.is_empty() => format!("{h}\n{history_line}"),
        _ => history_line,
    };
    attributes.insert(cf_att_name.to_string(), history.into());

    Ok(attributes)
}

/// One `history_json` record describing this run.
fn history_record(
    input_history: Option<&str>,
    parameters: &RequestParameters,
    provenance: &ProvenanceConfig,
    date_time: &str,
) -> Map<String, Value> {
    let params = parameters.history_parameters();
    let derived_from = params.get("input_file").cloned().unwrap_or(Value::Null);

    let mut record = Map::new();
    record.insert("$schema".to_string(), provenance.schema.clone().into());
    record.insert("date_time".to_string(), date_time.into());
    record.insert("program".to_string(), provenance.program.clone().into());
    record.insert("version".to_string(), provenance.version.clone().into());
    record.insert("parameters".to_string(), Value::Object(params));
    record.insert("derived_from".to_string(), derived_from);
    record.insert("program_ref".to_string(), provenance.program_ref.clone().into());
    if let Some(history) = input_history {
        let entries: Vec<Value> = history.split('\n').map(Value::from).collect();
        record.insert("cf_history".to_string(), Value::Array(entries));
    }
    record
}

/// Make sure every dimension of `variable` (at `path` in `source`) exists in
/// `output`, in the same group as in the source.
fn ensure_dimensions(
    source: &Dataset,
    output: &mut Dataset,
    path: &str,
    variable: &Variable,
) -> error_stack::Result<(), ReprojectError> {
    let (groups, _) = split_path(path);
    for dim in variable.dimensions() {
        if output.dimension_owner(&groups, dim).is_some() {
            continue;
        }
        let (depth, len) = source.dimension_owner(&groups, dim).ok_or_else(|| {
            ReprojectError::context(format!("finding dimension '{dim}' of {path}"))
        })?;
        output.add_group_dimension(&groups[..depth], dim, len);
    }
    Ok(())
}

/// Copy a variable unchanged, apart from compression.
fn copy_metadata_variable(
    source: &Dataset,
    output: &mut Dataset,
    path: &str,
    deflate_level: i32,
) -> error_stack::Result<(), ReprojectError> {
    log::info!("Adding metadata variable \"{path}\" to the output.");
    let variable = source
        .variable(path)
        .ok_or_else(|| ReprojectError::context(format!("reading variable {path}")))?;
    ensure_dimensions(source, output, path, variable)?;
    output
        .add_variable(path, variable.clone().with_deflate_level(deflate_level))
        .change_context_lazy(|| ReprojectError::context(format!("copying variable {path}")))
}

/// Copy a reprojected variable from its single band file, restoring the
/// source variable's attributes and storage.
fn copy_science_variable(
    input: &Dataset,
    output: &mut Dataset,
    single_band: &Dataset,
    path: &str,
    var_info: &VarInfo,
    deflate_level: i32,
) -> error_stack::Result<(), ReprojectError> {
    log::info!("Adding reprojected \"{path}\" to the output");
    let source = input
        .variable(path)
        .ok_or_else(|| ReprojectError::context(format!("reading source variable {path}")))?;
    let band = single_band
        .variable(path)
        .ok_or_else(|| ReprojectError::MissingReprojectedData(path.to_string()))?;

    let prepend_time = input.has_dimension(TIME) && !band.dimensions().iter().any(|d| d == TIME);
    let mut dimensions: Vec<String> = band.dimensions().to_vec();
    if prepend_time {
        dimensions.insert(0, TIME.to_string());
    }

    let mut attributes = source.attributes().clone();
    if let Some(grid_mapping) = band.attribute("grid_mapping") {
        attributes.insert("grid_mapping".to_string(), grid_mapping.clone());
    }
    if attributes.contains_key("coordinates")
        && !coordinates_still_valid(var_info, path, input, single_band)
    {
        attributes.shift_remove("coordinates");
    }

    let packing = source.scale_and_offset().unwrap_or(ScaleOffset {
        scale_factor: 1.0,
        add_offset: 0.0,
    });
    let fill = source.fill_value().unwrap_or(f64::NAN);
    let packed = band
        .unpacked_values()
        .mapv(|v| if v.is_nan() { fill } else { packing.pack(v) });

    let values = if prepend_time {
        let time_len = input.dimension_len(TIME).unwrap_or(1);
        let mut shape = vec![time_len];
        shape.extend_from_slice(packed.shape());
        let mut values = ArrayD::from_elem(IxDyn(&shape), fill);
        values
            .index_axis_mut(ndarray::Axis(0), 0)
            .assign(&packed);
        values
    } else {
        packed
    };

    let mut variable = Variable::new(path, &dimensions, NcArray::from_f64(source.dtype(), &values))
        .with_deflate_level(deflate_level);
    variable.set_attributes(attributes);
    output
        .add_variable(path, variable)
        .change_context_lazy(|| ReprojectError::context(format!("adding reprojected {path}")))
}

/// Whether the coordinates listed by a science variable still describe it
/// after reprojection: each must be present in the single band file with
/// the same shape it has in the source.
fn coordinates_still_valid(var_info: &VarInfo, path: &str, input: &Dataset, single_band: &Dataset) -> bool {
    let Some(coordinates) = var_info.coordinate_set(path) else {
        return false;
    };
    coordinates.references().iter().all(|coordinate| {
        match (single_band.variable(coordinate), input.variable(coordinate)) {
            (Some(reprojected), Some(original)) => reprojected.shape() == original.shape(),
            _ => false,
        }
    })
}
