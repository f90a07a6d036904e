/*!
Control the appearance of simulation result data

# Working with [`ResultsBuilder`]

## Examples

Creating a [`ResultsTable`] after running a simulation group:

```
use pow_network_sim::prelude::*;

let sim = SimulationBuilder::new()
    .peers(5)
    .max_blocks(Some(3))
    .txn_interval(200.0)
    .add_miner(Selfish::new())
    .peer_power(PeerId::from(0), 0.3)
    .repeat_all(2)
    .seed(1)
    .build()
    .unwrap();

let results_builder = sim.run_all().unwrap();

let results = results_builder
    .only_peers([PeerId::from(0)]) // Per-peer columns for peer 0 only
    .all()
    .average(Average::Median)      // Median over repeated simulations
    .format(Format::CSV)           // Output results as CSV
    .build();

println!("{}", results);
```

# Aggregating Results
Repeated runs of the same power distribution are aggregated with the chosen
[`Average`]. Strategy names and constants are taken from the first run of
each group; every other column is averaged.
*/

use std::{collections::BTreeSet, fmt::Display, num::NonZeroUsize};

use serde::Deserialize;

use crate::{
    peer::PeerId,
    power_dist::PowerValue,
    simulation::{SimulationOutput, SimulationSnapshot},
    utils::{median_of_floats, wrap, WrapFunc},
};

/// Floating point precision of results data.
pub const FLOAT_PRECISION_DIGITS: usize = 6;

/// Builder for [`ResultsTable`]. Typically produced by running a
/// [`SimulationGroup`](crate::simulation::SimulationGroup).
#[derive(Debug, Clone)]
pub struct ResultsBuilder {
    average: Average,
    columns: BTreeSet<Column>,
    data: Vec<SimulationOutput>,
    format: Format,
    peers: Vec<PeerId>,
    repeated: NonZeroUsize,
}

/// Describes the appearance of a [`ResultsTable`] table as given by its
/// [`Display`] implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum Format {
    /// Comma-separated, without extra whitespace.
    #[serde(rename = "csv")]
    CSV,
    /// Human-readable.
    #[default]
    #[serde(rename = "pretty")]
    PrettyPrint,
}

impl ResultsBuilder {
    /// Create a new [`ResultsBuilder`].
    pub(crate) fn new(
        data: Vec<SimulationOutput>,
        repeated: NonZeroUsize,
    ) -> Self {
        let num_peers = data.first().map_or(0, |output| output.peers.len());

        Self {
            data,
            repeated,
            average: Average::default(),
            columns: BTreeSet::default(),
            format: Format::default(),
            peers: (0..num_peers).map(PeerId::from).collect(),
        }
    }

    /// Include the "Blocks Broadcast", "Longest Chain Length",
    /// "Simulated Time", "Peer `X` Strategy", "Peer `X` Revenue" and
    /// "Peer `X` Blocks Mined" columns.
    ///
    /// [`ResultsBuilder::average`] must still be called separately
    /// to create averaged data.
    pub fn all(self) -> Self {
        self.blocks_broadcast()
            .longest_chain_length()
            .simulated_time()
            .strategy_names()
            .revenue()
            .blocks_mined()
    }

    /// Average the results of repeated simulations based on the given
    /// [`Average`] type. For types other than [`Average::None`], a column
    /// describing the averaging method will be included in the results table.
    pub fn average(mut self, average: Average) -> Self {
        self.average = average;

        self
    }

    /// Restrict per-peer columns added after this call, and the "Peer `X`
    /// Power" columns, to the given peers.
    pub fn only_peers<I>(mut self, peers: I) -> Self
    where
        I: IntoIterator<Item = PeerId>,
    {
        self.peers = peers.into_iter().collect();

        self
    }

    /// Include the "Blocks Broadcast" column in the results table.
    pub fn blocks_broadcast(mut self) -> Self {
        self.columns.insert(Column::BlocksBroadcast);

        self
    }

    /// Include a column with title `title` which only contains the given
    /// value.
    pub fn constant<T>(mut self, title: T, value: f64) -> Self
    where
        T: Into<String>,
    {
        self.columns.insert(Column::Constant(wrap!(title, move |_| value)));

        self
    }

    /// Extract the raw [`SimulationOutput`] data from this [`ResultsBuilder`].
    /// Useful for running custom statistical analysis.
    ///
    /// # Ordering
    /// Simulations are run in the same order they are specified using
    /// [`SimulationBuilder`](crate::simulation::SimulationBuilder), with
    /// repeated runs being grouped together. The output data from this
    /// method follows this ordering as well.
    pub fn data(self) -> Vec<SimulationOutput> {
        self.data
    }

    /// Exportable views of every run, in the order of [`data`](Self::data).
    pub fn snapshots(&self) -> Vec<SimulationSnapshot> {
        self.data.iter().map(SimulationOutput::snapshot).collect()
    }

    /// Include the "Longest Chain Length" column in the results table.
    pub fn longest_chain_length(mut self) -> Self {
        self.columns.insert(Column::LongestChainLength);

        self
    }

    /// Use the mining power of `peer` as input to `func`, and present the
    /// output in a table column with the given title.
    pub fn mining_power_func<T, F>(
        mut self,
        peer: PeerId,
        title: T,
        func: F,
    ) -> Self
    where
        T: Into<String>,
        F: Fn(PowerValue) -> f64 + Send + Sync + 'static,
    {
        self.columns.insert(Column::PowerFunction(peer, wrap!(title, func)));

        self
    }

    /// Include a "Peer `X` Strategy" column for each selected peer `X`.
    pub fn strategy_names(mut self) -> Self {
        for &peer in &self.peers {
            self.columns.insert(Column::PeerStrategyName(peer));
        }

        self
    }

    /// Include a "Peer `X` Revenue" column for each selected peer `X`: the
    /// fraction of the longest chain's blocks mined by `X`.
    pub fn revenue(mut self) -> Self {
        for &peer in &self.peers {
            self.columns.insert(Column::PeerRevenue(peer));
        }

        self
    }

    /// Include a "Peer `X` Blocks Mined" column for each selected peer `X`.
    pub fn blocks_mined(mut self) -> Self {
        for &peer in &self.peers {
            self.columns.insert(Column::PeerBlocksMined(peer));
        }

        self
    }

    /// Include the "Simulated Time" column in the results table.
    pub fn simulated_time(mut self) -> Self {
        self.columns.insert(Column::SimulatedTime);

        self
    }

    /// Specify the [`Format`] of the results table.
    pub fn format(mut self, format: Format) -> Self {
        self.format = format;

        self
    }

    /// Create new [`ResultsTable`].
    pub fn build(self) -> ResultsTable {
        let ResultsBuilder {
            average,
            mut columns,
            data,
            format,
            peers,
            repeated,
        } = self;

        for peer in peers {
            columns.insert(Column::PeerPower(peer));
        }
        if average != Average::None {
            columns.insert(Column::AverageOf(average));
        }

        let columns = Vec::from_iter(columns);
        let rows = match average {
            Average::None => data
                .iter()
                .map(|output| {
                    columns
                        .iter()
                        .map(|column| column.get_value(output))
                        .collect()
                })
                .collect(),
            _ => data
                .chunks(repeated.get())
                .map(|outputs| {
                    columns
                        .iter()
                        .map(|column| {
                            column.get_average_value(average, outputs)
                        })
                        .collect()
                })
                .collect(),
        };

        ResultsTable { columns, format, rows }
    }
}

/// Formatted results from the completion of a
/// [`SimulationGroup`](crate::simulation::SimulationGroup). The results table
/// is given by the struct's [`Display`] implementation, as specified by
/// its [`Format`].
pub struct ResultsTable {
    columns: Vec<Column>,
    format: Format,
    rows: Vec<Vec<ColumnValue>>,
}

impl ResultsTable {
    const SEPARATOR_VERTICAL: char = '|';
    const SEPARATOR_HORIZONTAL: char = '-';

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn set_format(&mut self, format: Format) {
        self.format = format;
    }

    /// Number of data rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl Display for ResultsTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let titles: Vec<_> =
            self.columns.iter().map(|column| column.to_string()).collect();

        match self.format {
            Format::CSV => {
                write!(f, "{}", titles.join(","))?;

                for row in self.rows.iter() {
                    writeln!(f)?;

                    let row: Vec<_> =
                        row.iter().map(|val| val.to_string()).collect();

                    write!(f, "{}", row.join(","))?;
                }
            }
            Format::PrettyPrint => {
                let mut text_widths: Vec<_> =
                    titles.iter().map(|title| title.len()).collect();

                for row in self.rows.iter() {
                    for (i, val) in row.iter().enumerate() {
                        text_widths[i] =
                            text_widths[i].max(val.to_string().len());
                    }
                }

                for (i, title) in titles.into_iter().enumerate() {
                    write!(
                        f,
                        " {:1$} {2}",
                        title,
                        text_widths[i],
                        Self::SEPARATOR_VERTICAL
                    )?;
                }
                writeln!(f)?;

                let total_width = text_widths.iter().map(|x| x + 3).sum();
                for _ in 0..total_width {
                    write!(f, "{}", Self::SEPARATOR_HORIZONTAL)?;
                }

                for row in self.rows.iter() {
                    writeln!(f)?;

                    for (i, val) in row.iter().enumerate() {
                        write!(
                            f,
                            " {:1$} {2}",
                            val.to_string(),
                            text_widths[i],
                            Self::SEPARATOR_VERTICAL
                        )?;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Methods of extracting an average/central value from a set of repeated
/// simulations.
#[repr(u8)]
#[derive(
    Default,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Average {
    #[default]
    /// Include all repeated values.
    None,
    /// Arithmetic mean of all values.
    Mean,
    /// Median of all values.
    Median,
    /// Maximum of all values.
    Max,
    /// Minimum of all values.
    Min,
}

impl Average {
    fn apply(self, values: Vec<f64>) -> f64 {
        let len = values.len() as f64;
        match self {
            Average::Mean => values.into_iter().sum::<f64>() / len,
            Average::Median => median_of_floats(values),
            Average::Max => {
                values.into_iter().reduce(f64::max).unwrap_or(f64::NAN)
            }
            Average::Min => {
                values.into_iter().reduce(f64::min).unwrap_or(f64::NAN)
            }
            Average::None => unreachable!("averaging with Average::None"),
        }
    }
}

/// Type of column that can appear in a data table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Column {
    // Variant order determines the order of columns in results tables:
    // https://doc.rust-lang.org/stable/std/cmp/trait.PartialOrd.html#derivable
    PeerStrategyName(PeerId),
    PeerPower(PeerId),
    PeerRevenue(PeerId),
    PeerBlocksMined(PeerId),
    PowerFunction(PeerId, WrapFunc<PowerValue, f64>),
    Constant(WrapFunc<(), f64>),
    AverageOf(Average),
    BlocksBroadcast,
    LongestChainLength,
    SimulatedTime,
}

/// Value which corresponds to a [`Column`].
#[derive(Debug, Clone)]
enum ColumnValue {
    Text(String),
    Count(usize),
    Float(f64),
}

impl Column {
    /// Numeric value of this column for one run. `None` for columns which
    /// are not averaged.
    fn number(&self, output: &SimulationOutput) -> Option<f64> {
        let power_of = |peer: &PeerId| {
            output.power_values.get(peer.get()).copied().unwrap_or(0.0)
        };

        let value = match &self {
            Self::PeerPower(peer) => power_of(peer),
            Self::PeerRevenue(peer) => output.revenue_of(*peer),
            Self::PeerBlocksMined(peer) => output.blocks_mined_by(*peer) as f64,
            Self::PowerFunction(peer, func) => func.call(power_of(peer)),
            Self::BlocksBroadcast => output.blocks_broadcast as f64,
            Self::LongestChainLength => output.longest_chain_length() as f64,
            Self::SimulatedTime => output.end_time.as_millis(),
            Self::PeerStrategyName(_)
            | Self::Constant(_)
            | Self::AverageOf(_) => return None,
        };

        Some(value)
    }

    fn get_value(&self, output: &SimulationOutput) -> ColumnValue {
        match &self {
            Self::PeerStrategyName(peer) => {
                let name = output
                    .peers
                    .get(peer.get())
                    .map_or_else(String::new, |p| p.miner().name());

                ColumnValue::Text(name)
            }
            Self::Constant(func) => ColumnValue::Float(func.call(())),
            Self::AverageOf(_) => unreachable!(
                "never need the single value of the average descriptor column"
            ),
            _ => ColumnValue::Float(self.number(output).unwrap_or(f64::NAN)),
        }
    }

    fn get_average_value(
        &self,
        method: Average,
        data: &[SimulationOutput],
    ) -> ColumnValue {
        match &self {
            Self::AverageOf(_) => ColumnValue::Count(data.len()),
            Self::PeerStrategyName(_) | Self::Constant(_) => {
                self.get_value(&data[0])
            }
            _ => {
                let values =
                    data.iter().filter_map(|o| self.number(o)).collect();

                ColumnValue::Float(method.apply(values))
            }
        }
    }
}

impl Display for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self {
            Self::AverageOf(method) => match method {
                Average::Mean => write!(f, "Mean Of"),
                Average::Median => write!(f, "Median Of"),
                Average::Max => write!(f, "Max Of"),
                Average::Min => write!(f, "Min Of"),
                Average::None => unreachable!(),
            },
            Self::BlocksBroadcast => write!(f, "Blocks Broadcast"),
            Self::Constant(func) => write!(f, "{}", func.name()),
            Self::PowerFunction(_, func) => write!(f, "{}", func.name()),
            Self::PeerStrategyName(peer) => {
                write!(f, "Peer {} Strategy", peer.get())
            }
            Self::PeerPower(peer) => write!(f, "Peer {} Power", peer.get()),
            Self::PeerRevenue(peer) => write!(f, "Peer {} Revenue", peer.get()),
            Self::PeerBlocksMined(peer) => {
                write!(f, "Peer {} Blocks Mined", peer.get())
            }
            Self::LongestChainLength => write!(f, "Longest Chain Length"),
            Self::SimulatedTime => write!(f, "Simulated Time (ms)"),
        }
    }
}

impl Display for ColumnValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self {
            Self::Text(text) => write!(f, "{}", text),
            Self::Count(count) => write!(f, "{}", count),
            Self::Float(value) => {
                write!(f, "{:.1$}", value, FLOAT_PRECISION_DIGITS)
            }
        }
    }
}

/// Returns an instance of the ideal Selfish Miner revenue function from Eyal
/// and Sirer's paper which can be used as input to
/// [`ResultsBuilder::mining_power_func`].
pub fn selfish_revenue(gamma: f64) -> impl Fn(PowerValue) -> f64 {
    move |a: PowerValue| -> f64 {
        (a * (1.0 - a).powi(2) * (4.0 * a + gamma * (1.0 - 2.0 * a))
            - a.powi(3))
            / (1.0 - a * (1.0 + a * (2.0 - a)))
    }
}
