use std::fmt::{Display, Write};

const PADDING: usize = 3;

pub struct Column<T> {
    header: &'static str,
    value: Box<dyn Fn(&T) -> String>,
}

pub struct Table<'a, T> {
    pub cols: Vec<Column<T>>,
    pub rows: &'a [T],
}

impl<T> Column<T> {
    pub fn new(header: &'static str, value: impl Fn(&T) -> String + 'static) -> Self {
        Self {
            header,
            value: Box::new(value),
        }
    }

    fn width(&self, rows: &[T]) -> usize {
        let width = rows
            .iter()
            .map(|row| (self.value)(row).chars().count())
            .max()
            .unwrap_or(0);
        self.header.len().max(width) + PADDING
    }
}

impl<T> Display for Table<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let widths = self
            .cols
            .iter()
            .map(|col| col.width(self.rows))
            .collect::<Vec<_>>();

        let last = self.cols.len().saturating_sub(1);
        let mut line = |cells: Vec<String>| -> std::fmt::Result {
            for (i, (cell, width)) in cells.iter().zip(&widths).enumerate() {
                if i == last {
                    f.write_str(cell)?;
                } else {
                    write!(f, "{cell:width$}")?;
                }
            }
            f.write_char('\n')
        };

        line(self.cols.iter().map(|col| col.header.to_string()).collect())?;
        for row in self.rows {
            line(self.cols.iter().map(|col| (col.value)(row)).collect())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_columns_to_widest_cell() {
        let rows = [("web", 8080), ("api-gateway", 80)];
        let table = Table {
            cols: vec![
                Column::new("NAME", |r: &(&str, u16)| r.0.to_string()),
                Column::new("PORT", |r: &(&str, u16)| r.1.to_string()),
            ],
            rows: &rows,
        };
        assert_eq!(
            table.to_string(),
            "NAME          PORT\nweb           8080\napi-gateway   80\n"
        );
    }

    #[test]
    fn empty_table_prints_headers() {
        let table = Table::<u8> {
            cols: vec![Column::new("WEIGHT", |w: &u8| w.to_string())],
            rows: &[],
        };
        assert_eq!(table.to_string(), "WEIGHT\n");
    }
}
